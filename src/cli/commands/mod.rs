//! CLI command implementations

pub mod check;
pub mod commit;
pub mod init;
pub mod invalidate;
pub mod run;
pub mod status;

pub use check::execute as check;
pub use commit::execute as commit;
pub use init::execute as init;
pub use invalidate::execute as invalidate;
pub use run::execute as run;
pub use status::execute as status;
