//! Safety policy: path resolution and the pre-execution gate.

mod gate;
mod path;

pub use gate::{
    AutoConfirm, Authorization, CommandPolicy, Confirmer, PathWarning, PlanPreview, SafetyGate,
    SafetyRejection,
};
pub use path::{lexical_normalize, PathError, PathResolver, UserDirs};
