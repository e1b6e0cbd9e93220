/// Replication metadata sizing.
///
/// Converts a requested net volume size into the backing-device size
/// needed once the internal metadata is added: a 4 KiB superblock, a
/// 32 KiB activity log, and one replication bitmap per peer (1 bit per
/// 4 KiB of net data, rounded up to 4 KiB). The same figures are what
/// metadata initialization writes, so the two always agree.

/// Superblock size in kiB.
const MD_SUPERBLOCK_KIB: u64 = 4;
/// Activity log size in kiB.
const MD_AL_KIB: u64 = 32;
/// Net kiB covered by one kiB of bitmap (1 bit per 4 KiB block).
const KIB_PER_BITMAP_KIB: u64 = 32 * 1024;

fn align_4k(kib: u64) -> u64 {
    kib.div_ceil(4).saturating_mul(4)
}

/// Gross backing-device size in kiB for a volume of `net_kib` replicated
/// to `peers` peers. Deterministic and monotonic in both arguments.
/// Saturates instead of wrapping for sizes near the u64 limit; such a
/// request cannot fit in any pool and fails at allocation, not here.
pub fn gross_size_kib(net_kib: u64, peers: u8) -> u64 {
    let bitmap_kib = align_4k(net_kib.div_ceil(KIB_PER_BITMAP_KIB));
    let md_kib = (MD_SUPERBLOCK_KIB + MD_AL_KIB)
        .saturating_add(bitmap_kib.saturating_mul(peers as u64));
    net_kib.saturating_add(align_4k(md_kib))
}
