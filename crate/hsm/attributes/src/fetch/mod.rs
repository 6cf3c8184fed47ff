mod entry;
mod policy;
mod process;

pub use entry::{AttributeValue, FetchedAttribute};
pub use policy::{AmbiguityPolicy, FetchMode};
pub use process::GetAttributeProcess;
