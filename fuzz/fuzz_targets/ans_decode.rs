#![no_main]
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must never panic the decoder, only fail cleanly.
fuzz_target!(|data: &[u8]| {
    let mut output = vec![0u8; 1 << 20];
    let _ = ans_simd::decode(&mut output, data);
});
