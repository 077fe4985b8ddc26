#![no_main]
use ans_simd::{compressed_bound, decode, encode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (Vec<u8>, u8)| {
    let (mut input, pb) = data;
    if input.is_empty() {
        return;
    }
    let prob_bits = 9 + (pb % 3) as u32;

    // Pad to a whole number of blocks; the codec rejects partial blocks.
    let padded = input.len().div_ceil(4096) * 4096;
    input.resize(padded, 0);

    let mut coded = vec![0u8; compressed_bound(input.len())];
    let n = encode(&mut coded, &input, prob_bits).unwrap();

    let mut output = vec![0u8; input.len()];
    let m = decode(&mut output, &coded[..n]).unwrap();
    assert_eq!(m, input.len());
    assert_eq!(input, output);
});
