pub mod credential;
pub mod log;
pub mod port_forward;
pub mod tunnel;
pub mod variable;

pub use credential::*;
pub use log::*;
pub use port_forward::*;
pub use tunnel::*;
pub use variable::*;
