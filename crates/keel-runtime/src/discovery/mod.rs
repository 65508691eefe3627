//! Script providers and downgrade pairing.

mod code;
mod downgrade;
mod embedded;
mod filesystem;

pub use code::CodeScriptProvider;
pub use downgrade::NamingConventionResolver;
pub(crate) use downgrade::same_script;
pub use embedded::EmbeddedScriptProvider;
pub use filesystem::FileSystemScriptProvider;
