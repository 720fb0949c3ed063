pub mod error;
pub mod priority;
pub mod task_id;
pub mod time;
pub mod value;

pub use error::Error;
pub use priority::Priority;
pub use task_id::TaskId;
pub use time::{TimeoutSpec, now};
pub use value::{Value, downcast, unit, value};
