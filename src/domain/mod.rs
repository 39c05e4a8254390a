pub mod proposal;
pub mod treasury;
pub mod worker;

pub use proposal::*;
pub use treasury::*;
pub use worker::*;
