/// The error type for invalid store construction parameters.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The requested hash table size cannot be honoured.
    #[error("table_size must be at least 1 (got {0})")]
    TableSize(u64),

    /// The log capacity must be a power of two and hold at least two pages.
    #[error("log_size_bytes must be a power of two of at least two pages (got {0})")]
    LogSize(u64),

    /// The log capacity does not fit the 48-bit logical address space.
    #[error("log_size_bytes {0} exceeds the 48-bit logical address space")]
    AddressSpace(u64),

    /// The record layout requires a stronger alignment than the log provides.
    #[error("record alignment {0} exceeds the log page alignment")]
    RecordAlignment(usize),
}
