//! Encoder engine: 32 interleaved rANS states per 4096-byte block, advanced
//! in lockstep as four 8-lane groups.
//!
//! Per symbol the engine renormalizes first (emitting the low 16 bits of any
//! state that would overflow), then updates
//! `state <- (state / pdf) << probBits + cdf + state % pdf`, with the divide
//! done by the table's `(shift, divM1)` reciprocal. Emitted words from the
//! eight lanes of a group are compacted with a 256-entry permutation table
//! keyed by the renormalization mask.

use crate::constants::{
    BLOCK_SIZE, ENCODED_BITS, ENCODED_MASK, LANES, MIN_STATE, STATE_BITS, WARP_SIZE,
};
use crate::container::{self, BlockIndexEntry, Header, Layout};
use crate::error::{Error, Result};
use crate::stats::{self, EncoderTable};
use crate::vector::U32x8;

/// For each 8-bit mask, a permutation packing the set lanes toward lane 0.
const fn build_write_permute() -> [[u32; 8]; 256] {
    let mut permute = [[0u32; 8]; 256];
    let mut m = 0;
    while m < 256 {
        let mut written = 0;
        let mut lane = 0;
        while lane < 8 {
            if m & (1 << lane) != 0 {
                permute[m][written] = lane as u32;
                written += 1;
            }
            lane += 1;
        }
        m += 1;
    }
    permute
}

#[repr(align(32))]
struct PermuteTable([[u32; 8]; 256]);

static WRITE_PERMUTE: PermuteTable = PermuteTable(build_write_permute());

/// How the engine fetches per-symbol table records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TableLoad {
    /// Broadcast when the alphabet fits in the first 16 entries, else gather.
    Auto,
    /// Indexed gather of the 64-bit record, keyed by symbol.
    Gather,
    /// Registers preloaded with entries 0..16, selected by permute + blend.
    Broadcast,
}

/// Compress `src` into `dst`, returning the container length in bytes.
///
/// `src` must be a positive multiple of 4096 bytes and `dst` at least
/// [`crate::compressed_bound`]`(src.len())` bytes.
///
/// # Errors
/// `PartialBlock`, `DstCapacityTooSmall` or `UnsupportedProbBits` per the
/// container contract.
pub fn encode(dst: &mut [u8], src: &[u8], prob_bits: u32) -> Result<usize> {
    let table = stats::build_table(src, prob_bits)?;
    encode_with_table(dst, src, &table)
}

/// [`encode`] with a precomputed [`EncoderTable`].
///
/// The table must describe the distribution of `src`; building it once and
/// reusing it across calls keeps statistics out of timed loops.
pub fn encode_with_table(dst: &mut [u8], src: &[u8], table: &EncoderTable) -> Result<usize> {
    encode_with_table_load(dst, src, table, TableLoad::Auto)
}

pub(crate) fn encode_with_table_load(
    dst: &mut [u8],
    src: &[u8],
    table: &EncoderTable,
    load: TableLoad,
) -> Result<usize> {
    if src.is_empty() || src.len() % BLOCK_SIZE != 0 {
        return Err(Error::PartialBlock(BLOCK_SIZE));
    }
    let need = container::compressed_bound(src.len());
    if dst.len() < need {
        return Err(Error::DstCapacityTooSmall {
            need,
            have: dst.len(),
        });
    }

    let prob_bits = table.prob_bits();
    let num_blocks = (src.len() / BLOCK_SIZE) as u32;
    let layout = Layout::new(num_blocks);

    let load = match load {
        TableLoad::Auto if table.max_symbol() < 16 => TableLoad::Broadcast,
        TableLoad::Auto => TableLoad::Gather,
        forced => forced,
    };

    // Deterministic output: the index padding is never read back but is part
    // of the container.
    dst[layout.block_index..layout.payload].fill(0);

    let mut total_words = 0usize;
    let mut states = [0u32; WARP_SIZE];
    for block in 0..num_blocks as usize {
        let block_in = &src[block * BLOCK_SIZE..][..BLOCK_SIZE];
        let start_word = total_words;
        let words = {
            let payload = &mut dst[layout.payload + 2 * start_word..];
            encode_block(block_in, table, prob_bits, payload, &mut states, load)
        };
        debug_assert!(words < (1 << 16));

        container::write_warp_state(dst, &layout, block, &states);
        BlockIndexEntry {
            uncompressed_words: BLOCK_SIZE as u32,
            compressed_words: words as u32,
            start_word: start_word as u32,
        }
        .write(dst, &layout, block);

        total_words += words;
    }

    let header = Header {
        num_blocks,
        total_uncompressed_words: src.len() as u32,
        total_compressed_words: total_words as u32,
        prob_bits,
        use_checksum: false,
        checksum: 0,
    };
    header.write(dst);

    let mut pdfs = [0u16; crate::constants::NUM_SYMBOLS];
    for (s, pdf) in pdfs.iter_mut().enumerate() {
        *pdf = table.pdf(s as u8);
    }
    container::write_probs(dst, &layout, &pdfs);

    log::debug!(
        "encoded {} bytes into {} blocks, {} payload words (probBits={})",
        src.len(),
        num_blocks,
        total_words,
        prob_bits
    );

    Ok(layout.payload + 2 * total_words)
}

/// Encode one full block, returning the number of 16-bit words written and
/// leaving the 32 final states in `states_out`.
fn encode_block(
    block: &[u8],
    table: &EncoderTable,
    prob_bits: u32,
    payload: &mut [u8],
    states_out: &mut [u32; WARP_SIZE],
    load: TableLoad,
) -> usize {
    debug_assert_eq!(block.len(), BLOCK_SIZE);

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            return match load {
                TableLoad::Broadcast => unsafe {
                    avx2::encode_block::<true>(block, table, prob_bits, payload, states_out)
                },
                _ => unsafe {
                    avx2::encode_block::<false>(block, table, prob_bits, payload, states_out)
                },
            };
        }
    }

    let _ = load;
    encode_block_scalar(block, table, prob_bits, payload, states_out)
}

/// Portable engine over the scalar-lane [`U32x8`] emulation. Must stay
/// bit-identical to the AVX2 kernel.
fn encode_block_scalar(
    block: &[u8],
    table: &EncoderTable,
    prob_bits: u32,
    payload: &mut [u8],
    states_out: &mut [u32; WARP_SIZE],
) -> usize {
    let entries = table.entries();
    let mut states = [U32x8::splat(MIN_STATE); WARP_SIZE / LANES];
    let mut cursor = 0usize;

    let state_check_mul = U32x8::splat(1 << (STATE_BITS - prob_bits));
    let one = U32x8::splat(1);
    let prob_scale = U32x8::splat(1 << prob_bits);

    for warp in block.chunks_exact(WARP_SIZE) {
        for (g, state) in states.iter_mut().enumerate() {
            let symbols = U32x8::widen_u8(&warp[g * LANES..]);
            let (pcs, div_m1) = U32x8::gather64(entries, symbols);
            let pdf = pcs.and(U32x8::splat(0xfff));
            let cdf = pcs.shr(12).and(U32x8::splat(0xfff));
            let shift = pcs.shr(24);

            // Renormalize: one word out per lane with state >= pdf << (31 - probBits).
            let write_v = state.gt(pdf.mul_lo(state_check_mul).sub(one));
            let write_m = write_v.mask();
            let perm = U32x8(WRITE_PERMUTE.0[write_m as usize]);
            let data = state.permute(perm).and(U32x8::splat(ENCODED_MASK));
            let count = write_m.count_ones() as usize;
            for k in 0..count {
                let off = 2 * (cursor + k);
                payload[off..off + 2].copy_from_slice(&(data.lane(k) as u16).to_le_bytes());
            }
            cursor += count;
            *state = write_v.blend(*state, state.shr(ENCODED_BITS));

            // Update: state <- (state / pdf) << probBits + cdf + state % pdf.
            let div = state.mul_hi(div_m1).add(*state).shr_var(shift);
            let rem = state.sub(div.mul_lo(pdf));
            *state = div.mul_lo(prob_scale).add(rem).add(cdf);
        }
    }

    for (g, state) in states.iter().enumerate() {
        state.store(&mut states_out[g * LANES..]);
    }
    cursor
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use super::*;
    use std::arch::x86_64::*;

    struct TableV {
        pcs: __m256i,
        div_m1: __m256i,
    }

    /// Encoder-table entries 0..16, split into 32-bit halves for the
    /// broadcast load path.
    struct Broadcast16 {
        lo_pcs: __m256i,
        hi_pcs: __m256i,
        lo_div: __m256i,
        hi_div: __m256i,
    }

    #[target_feature(enable = "avx2")]
    unsafe fn preload_broadcast(entries: &[u64; 256]) -> Broadcast16 {
        let mut lo_pcs = [0u32; 8];
        let mut hi_pcs = [0u32; 8];
        let mut lo_div = [0u32; 8];
        let mut hi_div = [0u32; 8];
        for i in 0..8 {
            lo_pcs[i] = entries[i] as u32;
            lo_div[i] = (entries[i] >> 32) as u32;
            hi_pcs[i] = entries[8 + i] as u32;
            hi_div[i] = (entries[8 + i] >> 32) as u32;
        }
        unsafe {
            Broadcast16 {
                lo_pcs: _mm256_loadu_si256(lo_pcs.as_ptr() as *const __m256i),
                hi_pcs: _mm256_loadu_si256(hi_pcs.as_ptr() as *const __m256i),
                lo_div: _mm256_loadu_si256(lo_div.as_ptr() as *const __m256i),
                hi_div: _mm256_loadu_si256(hi_div.as_ptr() as *const __m256i),
            }
        }
    }

    /// Zero-extend eight symbol bytes into u32 lanes.
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn load_symbols(src: *const u8) -> __m256i {
        unsafe { _mm256_cvtepu8_epi32(_mm_loadl_epi64(src as *const __m128i)) }
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn load_table<const BROADCAST: bool>(
        entries: &[u64; 256],
        bc: &Broadcast16,
        symbols: __m256i,
    ) -> TableV {
        unsafe {
            if BROADCAST {
                // All symbols are < 16: select from the preloaded halves by
                // permute on the low three bits, then blend on bit 3.
                let high = _mm256_cmpgt_epi32(symbols, _mm256_set1_epi32(7));
                let pcs = _mm256_blendv_epi8(
                    _mm256_permutevar8x32_epi32(bc.lo_pcs, symbols),
                    _mm256_permutevar8x32_epi32(bc.hi_pcs, symbols),
                    high,
                );
                let div_m1 = _mm256_blendv_epi8(
                    _mm256_permutevar8x32_epi32(bc.lo_div, symbols),
                    _mm256_permutevar8x32_epi32(bc.hi_div, symbols),
                    high,
                );
                TableV { pcs, div_m1 }
            } else {
                let base = entries.as_ptr() as *const i32;
                TableV {
                    pcs: _mm256_i32gather_epi32::<8>(base, symbols),
                    div_m1: _mm256_i32gather_epi32::<8>(base.add(1), symbols),
                }
            }
        }
    }

    /// High 32 bits of the lane-wise unsigned product.
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn mul_hi(a: __m256i, b: __m256i) -> __m256i {
        unsafe {
            let even = _mm256_srli_epi64::<32>(_mm256_mul_epu32(a, b));
            let odd = _mm256_mul_epu32(_mm256_srli_epi64::<32>(a), _mm256_srli_epi64::<32>(b));
            _mm256_blend_epi32::<0b1010_1010>(even, odd)
        }
    }

    /// Renormalize one group: returns the emitted word count and the packed
    /// words permuted to the low lanes.
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn prepare_write(state: &mut __m256i, table: &TableV, prob_bits: u32) -> (usize, __m256i) {
        unsafe {
            let pdf = _mm256_and_si256(table.pcs, _mm256_set1_epi32(0xfff));
            let check_mul = _mm256_set1_epi32(1 << (STATE_BITS - prob_bits));
            let threshold =
                _mm256_sub_epi32(_mm256_mullo_epi32(pdf, check_mul), _mm256_set1_epi32(1));
            let write_v = _mm256_cmpgt_epi32(*state, threshold);
            let write_m = _mm256_movemask_ps(_mm256_castsi256_ps(write_v)) as usize;

            let perm = _mm256_load_si256(WRITE_PERMUTE.0[write_m].as_ptr() as *const __m256i);
            let data = _mm256_permutevar8x32_epi32(*state, perm);

            let next = _mm256_srli_epi32::<16>(*state);
            *state = _mm256_blendv_epi8(*state, next, write_v);

            (
                write_m.count_ones() as usize,
                _mm256_and_si256(data, _mm256_set1_epi32(ENCODED_MASK as i32)),
            )
        }
    }

    /// Store two groups' packed words. Always writes 16 bytes per group; the
    /// cursor advances only past the selected lanes and later writes overwrite
    /// the rest.
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn write_pair(out: *mut u8, w0: usize, d0: __m256i, w1: usize, d1: __m256i) -> usize {
        unsafe {
            let packed = _mm256_packus_epi32(d0, d1);
            let packed = _mm256_permute4x64_epi64::<0xD8>(packed);

            _mm_storeu_si128(out as *mut __m128i, _mm256_extracti128_si256::<0>(packed));
            let out1 = out.add(2 * w0);
            _mm_storeu_si128(out1 as *mut __m128i, _mm256_extracti128_si256::<1>(packed));
        }
        w0 + w1
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn update(state: &mut __m256i, table: &TableV, prob_bits: u32) {
        unsafe {
            let pdf = _mm256_and_si256(table.pcs, _mm256_set1_epi32(0xfff));
            let cdf = _mm256_and_si256(_mm256_srli_epi32::<12>(table.pcs), _mm256_set1_epi32(0xfff));
            let shift = _mm256_srli_epi32::<24>(table.pcs);

            let div = _mm256_srlv_epi32(_mm256_add_epi32(mul_hi(*state, table.div_m1), *state), shift);
            let rem = _mm256_sub_epi32(*state, _mm256_mullo_epi32(div, pdf));
            *state = _mm256_add_epi32(
                _mm256_add_epi32(_mm256_mullo_epi32(div, _mm256_set1_epi32(1 << prob_bits)), rem),
                cdf,
            );
        }
    }

    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn encode_block<const BROADCAST: bool>(
        block: &[u8],
        table: &EncoderTable,
        prob_bits: u32,
        payload: &mut [u8],
        states_out: &mut [u32; WARP_SIZE],
    ) -> usize {
        let entries = table.entries();
        let src = block.as_ptr();

        unsafe {
            let bc = preload_broadcast(entries);

            let mut states = [_mm256_set1_epi32(MIN_STATE as i32); 4];
            let mut tables = [
                load_table::<BROADCAST>(entries, &bc, load_symbols(src)),
                load_table::<BROADCAST>(entries, &bc, load_symbols(src.add(LANES))),
                load_table::<BROADCAST>(entries, &bc, load_symbols(src.add(2 * LANES))),
                load_table::<BROADCAST>(entries, &bc, load_symbols(src.add(3 * LANES))),
            ];

            let out_base = payload.as_mut_ptr();
            let out_end = out_base as usize + payload.len();
            let mut out = out_base;

            let mut i = 0;
            while i < BLOCK_SIZE {
                // A warp emits at most 32 words (64 bytes); each 16-byte
                // store may overhang by 16. The capacity contract keeps this
                // in bounds; a violation means a mismatched encoder table.
                assert!(out as usize + 80 <= out_end, "payload capacity exceeded");

                let mut s = 0;
                while s < 4 {
                    let (w0, d0) = prepare_write(&mut states[s], &tables[s], prob_bits);
                    let (w1, d1) = prepare_write(&mut states[s + 1], &tables[s + 1], prob_bits);
                    let written = write_pair(out, w0, d0, w1, d1);
                    out = out.add(2 * written);

                    for t in 0..2 {
                        update(&mut states[s + t], &tables[s + t], prob_bits);
                        if i + WARP_SIZE < BLOCK_SIZE {
                            let next = src.add(i + WARP_SIZE + (s + t) * LANES);
                            tables[s + t] = load_table::<BROADCAST>(entries, &bc, load_symbols(next));
                        }
                    }
                    s += 2;
                }
                i += WARP_SIZE;
            }

            for (g, state) in states.iter().enumerate() {
                _mm256_storeu_si256(
                    states_out[g * LANES..].as_mut_ptr() as *mut __m256i,
                    *state,
                );
            }

            (out.offset_from(out_base) as usize) / 2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_permute_packs_set_lanes_low() {
        let p = &WRITE_PERMUTE.0;
        assert_eq!(p[0b0000_0000], [0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(p[0b1111_1111], [0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(p[0b0010_0101][..3], [0, 2, 5]);
        assert_eq!(p[0b1000_0000][..1], [7]);
    }

    #[test]
    fn states_stay_in_range_while_encoding() {
        let src: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i * 7 % 256) as u8).collect();
        let table = stats::build_table(&src, 10).unwrap();
        let mut payload = vec![0u8; container::compressed_bound(src.len())];
        let mut states = [0u32; WARP_SIZE];
        encode_block_scalar(&src, &table, 10, &mut payload, &mut states);
        for &s in &states {
            assert!(s >= MIN_STATE);
            assert!(s < 1 << STATE_BITS);
        }
    }

    #[test]
    fn rejects_partial_blocks_and_small_destinations() {
        let mut dst = vec![0u8; 1 << 16];
        assert!(matches!(
            encode(&mut dst, &[0u8; 100], 10),
            Err(Error::PartialBlock(_))
        ));
        assert!(matches!(
            encode(&mut dst, &[], 10),
            Err(Error::PartialBlock(_))
        ));

        let src = vec![0u8; BLOCK_SIZE];
        let mut small = vec![0u8; 128];
        assert!(matches!(
            encode(&mut small, &src, 10),
            Err(Error::DstCapacityTooSmall { .. })
        ));

        assert!(matches!(
            encode(&mut dst, &src, 8),
            Err(Error::UnsupportedProbBits(8))
        ));
        assert!(matches!(
            encode(&mut dst, &src, 12),
            Err(Error::UnsupportedProbBits(12))
        ));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn avx2_kernel_matches_scalar_engine() {
        if !is_x86_feature_detected!("avx2") {
            return;
        }
        let src: Vec<u8> = (0..BLOCK_SIZE)
            .map(|i| ((i * 2654435761usize) >> 13) as u8)
            .collect();
        for prob_bits in [9, 10, 11] {
            let table = stats::build_table(&src, prob_bits).unwrap();
            let cap = container::compressed_bound(src.len());

            let mut scalar_payload = vec![0u8; cap];
            let mut scalar_states = [0u32; WARP_SIZE];
            let scalar_words =
                encode_block_scalar(&src, &table, prob_bits, &mut scalar_payload, &mut scalar_states);

            let mut simd_payload = vec![0u8; cap];
            let mut simd_states = [0u32; WARP_SIZE];
            let simd_words = unsafe {
                avx2::encode_block::<false>(&src, &table, prob_bits, &mut simd_payload, &mut simd_states)
            };

            assert_eq!(scalar_words, simd_words);
            assert_eq!(scalar_states, simd_states);
            assert_eq!(
                scalar_payload[..2 * scalar_words],
                simd_payload[..2 * simd_words]
            );
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn broadcast_load_matches_gather_load() {
        if !is_x86_feature_detected!("avx2") {
            return;
        }
        // Alphabet limited to 0..16 so the broadcast path is legal.
        let src: Vec<u8> = (0..2 * BLOCK_SIZE).map(|i| ((i * 31) % 16) as u8).collect();
        let table = stats::build_table(&src, 10).unwrap();
        assert!(table.max_symbol() < 16);

        let cap = container::compressed_bound(src.len());
        let mut gathered = vec![0u8; cap];
        let mut broadcast = vec![0u8; cap];
        let n0 = encode_with_table_load(&mut gathered, &src, &table, TableLoad::Gather).unwrap();
        let n1 = encode_with_table_load(&mut broadcast, &src, &table, TableLoad::Broadcast).unwrap();
        assert_eq!(n0, n1);
        assert_eq!(gathered[..n0], broadcast[..n1]);
    }
}
