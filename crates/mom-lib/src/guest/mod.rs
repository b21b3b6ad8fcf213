//! Guest-resident side of the control loop

mod policy;
mod resource_control;

pub use policy::{GuestPolicy, Script};
pub use resource_control::{
    ApplicationControl, DynamicResourceControl, MeminfoSource, MemorySource,
    ReportingApplication,
};
