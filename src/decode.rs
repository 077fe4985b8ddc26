//! Decoder engine: rebuilds the flat symbol lookup table from the stored
//! probabilities, loads each block's 32 saved states and walks the payload
//! backwards, producing 4096 bytes per block.
//!
//! A lookup keyed by the low `probBits` of a state yields
//! `(symbol, pdf, slot)`; the state update is
//! `state <- pdf * (state >> probBits) + slot`, and any state that falls
//! below `L` pulls one 16-bit word from the input tail. Word-to-lane routing
//! uses a 256-entry permutation table keyed by the refill mask.

use crate::constants::{
    BLOCK_SIZE, ENCODED_BITS, LANES, MAX_PROB_BITS, MIN_PROB_BITS, MIN_STATE, NUM_SYMBOLS,
    WARP_SIZE,
};
use crate::container::{self, BlockIndexEntry, Header, Layout};
use crate::error::{Error, Result};
use crate::vector::U32x8;

/// For each 8-bit refill mask, a permutation routing the last `popcount`
/// loaded words into the lanes that need them, in ascending lane order.
const fn build_read_permute() -> [[u32; 8]; 256] {
    let mut permute = [[0u32; 8]; 256];
    let mut m = 0;
    while m < 256 {
        let mut remainder = 8u32;
        let mut lane = 8usize;
        while lane > 0 {
            lane -= 1;
            if m & (1 << lane) != 0 {
                remainder -= 1;
                permute[m][lane] = remainder;
            }
        }
        m += 1;
    }
    permute
}

#[repr(align(32))]
struct PermuteTable([[u32; 8]; 256]);

static READ_PERMUTE: PermuteTable = PermuteTable(build_read_permute());

/// Flat lookup entries packed as `slot << 20 | pdf << 8 | symbol`.
fn build_decode_table(pdfs: &[u16; NUM_SYMBOLS], prob_bits: u32) -> Result<Vec<u32>> {
    let size = 1usize << prob_bits;
    let mut table = vec![0u32; size];

    let mut cdf = 0usize;
    for (sym, &pdf) in pdfs.iter().enumerate() {
        let pdf = pdf as usize;
        if pdf == 0 {
            continue;
        }
        let end = cdf + pdf;
        if end > size {
            return Err(Error::Corrupted("symbol probabilities overflow the table"));
        }
        for (slot, entry) in table[cdf..end].iter_mut().enumerate() {
            *entry = ((slot as u32) << 20) | ((pdf as u32) << 8) | sym as u32;
        }
        cdf = end;
    }
    if cdf != size {
        return Err(Error::Corrupted("symbol probabilities do not fill the table"));
    }
    Ok(table)
}

/// Decompress the container in `src` into `dst`, returning the decoded byte
/// count.
///
/// # Errors
/// `BadMagic`/`BadVersion` on a foreign header, `DstCapacityTooSmall` if
/// `dst` cannot hold the decoded data, `PartialBlock` if any block is not a
/// full 4096 bytes, `UnsupportedProbBits` for an out-of-range resolution, and
/// `Truncated`/`Corrupted` when the input is shorter than its header claims.
pub fn decode(dst: &mut [u8], src: &[u8]) -> Result<usize> {
    let header = Header::parse(src)?;
    if header.total_uncompressed_words == 0 {
        return Ok(0);
    }

    let prob_bits = header.prob_bits;
    if !(MIN_PROB_BITS..=MAX_PROB_BITS).contains(&prob_bits) {
        return Err(Error::UnsupportedProbBits(prob_bits));
    }

    let total = header.total_uncompressed_words as usize;
    if dst.len() < total {
        return Err(Error::DstCapacityTooSmall {
            need: total,
            have: dst.len(),
        });
    }
    if header.num_blocks as u64 * BLOCK_SIZE as u64 != total as u64 {
        return Err(Error::PartialBlock(BLOCK_SIZE));
    }

    let need = header.total_compressed_size();
    if src.len() < need {
        return Err(Error::Truncated {
            need,
            have: src.len(),
        });
    }

    let layout = Layout::new(header.num_blocks);
    let pdfs = container::read_probs(src, &layout);
    let table = build_decode_table(&pdfs, prob_bits)?;

    for block in 0..header.num_blocks as usize {
        let entry = BlockIndexEntry::read(src, &layout, block);
        if entry.uncompressed_words != BLOCK_SIZE as u32 {
            return Err(Error::PartialBlock(BLOCK_SIZE));
        }
        if entry.start_word as u64 + entry.compressed_words as u64
            > header.total_compressed_words as u64
        {
            return Err(Error::Corrupted("block payload range out of bounds"));
        }

        let states = container::read_warp_state(src, &layout, block);
        let out = &mut dst[block * BLOCK_SIZE..][..BLOCK_SIZE];
        decode_block(out, src, &layout, &entry, &table, prob_bits, &states);
    }

    log::debug!(
        "decoded {} blocks into {} bytes (probBits={})",
        header.num_blocks,
        total,
        prob_bits
    );

    Ok(total)
}

fn decode_block(
    out: &mut [u8],
    src: &[u8],
    layout: &Layout,
    entry: &BlockIndexEntry,
    table: &[u32],
    prob_bits: u32,
    states_in: &[u32; WARP_SIZE],
) {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            let end =
                layout.payload + 2 * (entry.start_word + entry.compressed_words) as usize;
            unsafe {
                avx2::decode_block(out, src, end, table, prob_bits, states_in);
            }
            return;
        }
    }

    let start = layout.payload + 2 * entry.start_word as usize;
    let payload = &src[start..][..2 * entry.compressed_words as usize];
    decode_block_scalar(out, payload, table, prob_bits, states_in);
}

/// Portable engine over the scalar-lane [`U32x8`] emulation. Must stay
/// bit-identical to the AVX2 kernel.
fn decode_block_scalar(
    out: &mut [u8],
    payload: &[u8],
    table: &[u32],
    prob_bits: u32,
    states_in: &[u32; WARP_SIZE],
) {
    debug_assert_eq!(out.len(), BLOCK_SIZE);

    let idx_mask = U32x8::splat((1u32 << prob_bits) - 1);
    let min_state = U32x8::splat(MIN_STATE);
    let byte_mask = U32x8::splat(0xff);

    let mut states = [U32x8::splat(0); WARP_SIZE / LANES];
    let mut tables = [U32x8::splat(0); WARP_SIZE / LANES];
    for g in 0..states.len() {
        states[g] = U32x8::load(&states_in[g * LANES..]);
        tables[g] = U32x8::gather32(table, states[g].and(idx_mask));
    }

    let mut cursor = payload.len() / 2;

    let mut i = BLOCK_SIZE;
    while i != 0 {
        i -= WARP_SIZE;
        for s in [2usize, 0] {
            for g in [s, s + 1] {
                let symbols = tables[g].and(byte_mask);
                let base = i + g * LANES;
                for lane in 0..LANES {
                    out[base + lane] = symbols.lane(lane) as u8;
                }
            }

            for g in [s + 1, s] {
                let pdf = tables[g].shr(8).and(U32x8::splat(0xfff));
                let slot = tables[g].shr(20);
                let state = pdf.mul_lo(states[g].shr(prob_bits)).add(slot);

                // Refill: any lane under L pulls one word off the tail.
                let read_v = state.lt(min_state);
                let read_m = read_v.mask();
                let perm = U32x8(READ_PERMUTE.0[read_m as usize]);
                let data = U32x8::widen_u16_tail(payload, cursor).permute(perm);
                let refilled = state.shl(ENCODED_BITS).add(data);
                states[g] = read_v.blend(state, refilled);
                cursor = cursor.saturating_sub(read_m.count_ones() as usize);

                tables[g] = U32x8::gather32(table, states[g].and(idx_mask));
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use super::*;
    use std::arch::x86_64::*;

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn lookup(table: *const i32, state: __m256i, idx_mask: __m256i) -> __m256i {
        unsafe { _mm256_i32gather_epi32::<4>(table, _mm256_and_si256(state, idx_mask)) }
    }

    /// Pack two groups' 32-bit symbols down to bytes and store 8 + 8 bytes.
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn write_symbols(out: *mut u8, s0: __m256i, s1: __m256i) {
        unsafe {
            let packed = _mm256_packus_epi32(s0, s1);
            let packed = _mm256_permute4x64_epi64::<0xD8>(packed);
            let packed = _mm256_packus_epi16(packed, packed);

            let x0 = _mm256_extract_epi64::<0>(packed) as u64;
            let x1 = _mm256_extract_epi64::<2>(packed) as u64;
            (out as *mut u64).write_unaligned(x0.to_le());
            (out.add(8) as *mut u64).write_unaligned(x1.to_le());
        }
    }

    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn decode_block(
        out: &mut [u8],
        src: &[u8],
        payload_end: usize,
        table: &[u32],
        prob_bits: u32,
        states_in: &[u32; WARP_SIZE],
    ) {
        debug_assert_eq!(out.len(), BLOCK_SIZE);
        debug_assert!(payload_end <= src.len());

        let base = src.as_ptr();
        let tbl = table.as_ptr() as *const i32;
        let out_ptr = out.as_mut_ptr();

        unsafe {
            let idx_mask = _mm256_set1_epi32(((1u32 << prob_bits) - 1) as i32);
            let min_state = _mm256_set1_epi32(MIN_STATE as i32);
            let byte_mask = _mm256_set1_epi32(0xff);
            let pb_count = _mm_cvtsi32_si128(prob_bits as i32);

            let mut states = [_mm256_setzero_si256(); 4];
            let mut tables = [_mm256_setzero_si256(); 4];
            for g in 0..4 {
                states[g] =
                    _mm256_loadu_si256(states_in[g * LANES..].as_ptr() as *const __m256i);
                tables[g] = lookup(tbl, states[g], idx_mask);
            }

            // Byte offset one past the last unread payload word.
            let mut cursor = payload_end;

            let mut i = BLOCK_SIZE;
            while i != 0 {
                i -= WARP_SIZE;
                for s in [2usize, 0] {
                    write_symbols(
                        out_ptr.add(i + s * LANES),
                        _mm256_and_si256(tables[s], byte_mask),
                        _mm256_and_si256(tables[s + 1], byte_mask),
                    );

                    for g in [s + 1, s] {
                        let pdf = _mm256_and_si256(
                            _mm256_srli_epi32::<8>(tables[g]),
                            _mm256_set1_epi32(0xfff),
                        );
                        let slot = _mm256_srli_epi32::<20>(tables[g]);
                        let state = _mm256_add_epi32(
                            _mm256_mullo_epi32(pdf, _mm256_srl_epi32(states[g], pb_count)),
                            slot,
                        );

                        let read_v = _mm256_cmpgt_epi32(min_state, state);
                        let read_m =
                            _mm256_movemask_ps(_mm256_castsi256_ps(read_v)) as usize;

                        // The container guarantees at least 16 readable bytes
                        // before any valid cursor position; the zero branch
                        // only triggers on corrupt input.
                        let data = if cursor >= 16 {
                            _mm256_cvtepu16_epi32(_mm_loadu_si128(
                                base.add(cursor - 16) as *const __m128i
                            ))
                        } else {
                            _mm256_setzero_si256()
                        };
                        let perm = _mm256_load_si256(
                            READ_PERMUTE.0[read_m].as_ptr() as *const __m256i
                        );
                        let data = _mm256_permutevar8x32_epi32(data, perm);

                        let refilled =
                            _mm256_add_epi32(_mm256_slli_epi32::<16>(state), data);
                        states[g] = _mm256_blendv_epi8(state, refilled, read_v);
                        cursor = cursor.saturating_sub(2 * read_m.count_ones() as usize);

                        tables[g] = lookup(tbl, states[g], idx_mask);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode;

    #[test]
    fn read_permute_routes_tail_words_to_lagging_lanes() {
        let p = &READ_PERMUTE.0;
        assert_eq!(p[0b0000_0000], [0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(p[0b1111_1111], [0, 1, 2, 3, 4, 5, 6, 7]);
        // Lanes 0 and 5 refill: lane 0 takes the older word.
        assert_eq!(p[0b0010_0001][0], 6);
        assert_eq!(p[0b0010_0001][5], 7);
        // A single refilling lane always takes the newest word.
        assert_eq!(p[0b0001_0000][4], 7);
    }

    #[test]
    fn decode_table_covers_every_slot() {
        let src: Vec<u8> = (0..8192).map(|i| (i * 13 % 200) as u8).collect();
        let table = crate::stats::build_table(&src, 10).unwrap();

        let mut pdfs = [0u16; NUM_SYMBOLS];
        for (s, pdf) in pdfs.iter_mut().enumerate() {
            *pdf = table.pdf(s as u8);
        }
        let lookup = build_decode_table(&pdfs, 10).unwrap();
        assert_eq!(lookup.len(), 1 << 10);

        let mut cdf = 0u32;
        for (s, &pdf) in pdfs.iter().enumerate() {
            let pdf = pdf as u32;
            for slot in 0..pdf {
                let entry = lookup[(cdf + slot) as usize];
                assert_eq!(entry & 0xff, s as u32);
                assert_eq!((entry >> 8) & 0xfff, pdf);
                assert_eq!(entry >> 20, slot);
            }
            cdf += pdf;
        }
        assert_eq!(cdf, 1 << 10);
    }

    #[test]
    fn decode_table_rejects_bad_probabilities() {
        let mut pdfs = [0u16; NUM_SYMBOLS];
        pdfs[0] = 1000;
        assert!(matches!(
            build_decode_table(&pdfs, 10),
            Err(Error::Corrupted(_))
        ));
        pdfs[0] = 5000;
        assert!(matches!(
            build_decode_table(&pdfs, 10),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn decode_rejects_foreign_headers() {
        let src = vec![0u8; BLOCK_SIZE];
        let mut coded = vec![0u8; container::compressed_bound(src.len())];
        let n = encode(&mut coded, &src, 10).unwrap();
        coded.truncate(n);

        let mut out = vec![0u8; src.len()];

        let mut bad_magic = coded.clone();
        bad_magic[3] = 0x55;
        assert!(matches!(
            decode(&mut out, &bad_magic),
            Err(Error::BadMagic { .. })
        ));

        let mut bad_version = coded.clone();
        bad_version[0] = 0x07;
        assert!(matches!(
            decode(&mut out, &bad_version),
            Err(Error::BadVersion { .. })
        ));

        let mut short = vec![0u8; 8];
        short.copy_from_slice(&coded[..8]);
        assert!(matches!(
            decode(&mut out, &short),
            Err(Error::Truncated { .. })
        ));

        let mut small_out = vec![0u8; 100];
        assert!(matches!(
            decode(&mut small_out, &coded),
            Err(Error::DstCapacityTooSmall { .. })
        ));
    }

    #[test]
    fn empty_container_decodes_to_nothing() {
        let mut buf = vec![0u8; 32];
        Header {
            num_blocks: 0,
            total_uncompressed_words: 0,
            total_compressed_words: 0,
            prob_bits: 10,
            use_checksum: false,
            checksum: 0,
        }
        .write(&mut buf);
        let mut out = vec![0u8; 16];
        assert_eq!(decode(&mut out, &buf).unwrap(), 0);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn avx2_kernel_matches_scalar_engine() {
        if !is_x86_feature_detected!("avx2") {
            return;
        }
        let src: Vec<u8> = (0..2 * BLOCK_SIZE)
            .map(|i| ((i * 0x9e3779b9usize) >> 17) as u8)
            .collect();
        for prob_bits in [9, 10, 11] {
            let mut coded = vec![0u8; container::compressed_bound(src.len())];
            let n = encode(&mut coded, &src, prob_bits).unwrap();
            coded.truncate(n);

            let header = Header::parse(&coded).unwrap();
            let layout = Layout::new(header.num_blocks);
            let pdfs = container::read_probs(&coded, &layout);
            let table = build_decode_table(&pdfs, prob_bits).unwrap();

            for block in 0..header.num_blocks as usize {
                let entry = BlockIndexEntry::read(&coded, &layout, block);
                let states = container::read_warp_state(&coded, &layout, block);

                let mut scalar_out = vec![0u8; BLOCK_SIZE];
                let start = layout.payload + 2 * entry.start_word as usize;
                let payload = &coded[start..][..2 * entry.compressed_words as usize];
                decode_block_scalar(&mut scalar_out, payload, &table, prob_bits, &states);

                let mut simd_out = vec![0u8; BLOCK_SIZE];
                let end = layout.payload
                    + 2 * (entry.start_word + entry.compressed_words) as usize;
                unsafe {
                    avx2::decode_block(&mut simd_out, &coded, end, &table, prob_bits, &states);
                }

                assert_eq!(scalar_out, simd_out);
                assert_eq!(scalar_out, &src[block * BLOCK_SIZE..][..BLOCK_SIZE]);
            }
        }
    }
}
