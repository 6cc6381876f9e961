/// Capacity of the IDE controller's PIO buffer: 16 sectors of 512 bytes, per
/// spec.md §3 ("a PIO buffer of 16 × 512 bytes"). Oversized transfer requests
/// (e.g. a multi-sector command whose chunk would not fit) are rejected
/// against this bound rather than allowed to overrun the canaries.
pub const MAX_IDE_DATA_BUFFER_BYTES: usize = 16 * 512;

/// Capacity of the FDC's DMA-coupled scratch buffer, per spec.md §3.
pub const MAX_FDC_DMA_BUFFER_BYTES: usize = 16 * 1024;
