use bitflags::bitflags;

bitflags! {
    /// What a blocked application call may now be able to do.
    pub(crate) struct Available: u8 {
        /// bytes are waiting in the receive queue
        const READ = 0b00000001;
        /// the send window has a free slot
        const WRITE = 0b00000010;
        /// every sent segment has been acknowledged
        const FLUSHED = 0b00000100;
    }
}
