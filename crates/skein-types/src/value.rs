use std::any::Any;
use std::rc::Rc;

/// Dynamically typed payload carried by signals, join results, and task
/// terminal values.
///
/// The scheduler is single-threaded, so `Rc` is sufficient; cloning is a
/// refcount bump, which is what lets one signal fan out to many waiters
/// and one task result reach many joiners.
pub type Value = Rc<dyn Any>;

/// Wrap a concrete value.
pub fn value<T: 'static>(v: T) -> Value {
    Rc::new(v)
}

/// The unit value, for tasks that complete without a meaningful result.
pub fn unit() -> Value {
    Rc::new(())
}

/// Borrow the payload as `T`, or `None` on a type mismatch.
pub fn downcast<T: 'static>(v: &Value) -> Option<&T> {
    v.downcast_ref::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_recovers_the_wrapped_type() {
        let v = value(42_u32);
        assert_eq!(downcast::<u32>(&v), Some(&42));
        assert_eq!(downcast::<i64>(&v), None);
    }

    #[test]
    fn clones_share_the_allocation() {
        let v = value(String::from("shared"));
        let w = v.clone();
        assert_eq!(
            downcast::<String>(&v).map(String::as_str),
            downcast::<String>(&w).map(String::as_str),
        );
    }
}
