//! Kernel input: readers, classification, ghost filtering, hot-plug

pub mod classify;
pub mod ghost;
pub mod reader;
pub mod supervisor;

pub use classify::{classify, AxisCalibration, DeviceClass};
pub use reader::{spawn_reader, ReaderHandle};
pub use supervisor::{DeviceList, DeviceSupervisor, DeviceView, SupervisorCommand};
