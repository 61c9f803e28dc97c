mod master;
mod worker;

pub use master::Master;
pub use worker::Worker;
