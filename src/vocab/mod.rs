mod constraints;
mod markers;
mod project_name;
mod reqparse;
mod specifier;
mod tag;
mod version;
mod wheel_name;

// All this stuff is also re-exported from crate::prelude::*

pub use self::constraints::{InterpreterConstraint, InterpreterConstraints, PythonImpl};
pub use self::markers::{marker, MarkerEnvironment};
pub use self::project_name::ProjectName;
pub use self::specifier::{CompareOp, Specifier, Specifiers};
pub use self::tag::{RankedTags, Tag};
pub use self::version::{PreRelease, Version};
pub use self::wheel_name::WheelName;
