//! Data movement between memory and the backing file.
//!
//! - [`allocator`]: Byte-range allocation within the data file
//! - [`disk_io`]: Striped random-access reads and writes
//! - [`scheduler`]: The single background worker and its FIFO queue

pub mod allocator;
pub mod disk_io;
pub mod scheduler;
