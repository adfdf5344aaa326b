pub(crate) mod available;
pub(crate) mod control_block;
pub(crate) mod receive_queue;
pub mod segment;
pub(crate) mod seq_space;
pub(crate) mod util;
