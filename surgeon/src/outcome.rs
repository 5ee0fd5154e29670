/// Result of an external step the surgeon may do without.
///
/// Shape inference and simplification either hand back a new value or
/// explain why they were skipped; the caller then keeps its previous state.
#[derive(Debug, Clone, PartialEq)]
pub enum BestEffort<T> {
    Ok(T),
    SkippedWithWarning(String),
}

impl<T> BestEffort<T> {
    /// Turn any error into a skip, keeping its whole context chain.
    pub fn from_result<E: std::fmt::Debug>(result: Result<T, E>) -> BestEffort<T> {
        match result {
            Ok(t) => BestEffort::Ok(t),
            Err(e) => BestEffort::SkippedWithWarning(format!("{e:?}")),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, BestEffort::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            BestEffort::Ok(t) => Some(t),
            BestEffort::SkippedWithWarning(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> BestEffort<U> {
        match self {
            BestEffort::Ok(t) => BestEffort::Ok(f(t)),
            BestEffort::SkippedWithWarning(reason) => BestEffort::SkippedWithWarning(reason),
        }
    }

    /// Value on success, `previous` otherwise, reporting the skip reason to `on_skip`.
    pub fn or_keep(self, previous: T, on_skip: impl FnOnce(&str)) -> T {
        match self {
            BestEffort::Ok(t) => t,
            BestEffort::SkippedWithWarning(reason) => {
                on_skip(&reason);
                previous
            }
        }
    }
}
