use regbus::crc::{
    compact_frame, crc8_update, frame_len, prepare_frame, seed_address,
    verify_frame, DIR_READ, DIR_WRITE,
};

/// Small deterministic generator so payloads vary without a rand
/// dependency.
struct XorShift(u32);

impl XorShift {
    fn next_byte(&mut self) -> u8 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x as u8
    }

    fn fill(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.next_byte();
        }
    }
}

#[test]
fn known_vector_matches_wire_layout() {
    // Two-byte write to register 0x10 of the device at address 0x08: the
    // checksum covers {address << 1, register, payload}.
    let crc = crc8_update(0, &[0x08 << 1, 0x10, 0xab, 0xcd]);
    assert_eq!(crc, 0x27);

    let mut out = [0u8; 8];
    let n = prepare_frame(
        seed_address(0x08, DIR_WRITE),
        0x10,
        &[0xab, 0xcd],
        None,
        &mut out,
    );
    assert_eq!(n, 3);
    assert_eq!(&out[..n], &[0xab, 0xcd, 0x27]);
}

#[test]
fn accumulator_self_check_is_zero() {
    let mut gen = XorShift(0xdead_beef);
    for _ in 0..64 {
        let mut data = [0u8; 9];
        gen.fill(&mut data[..8]);
        data[8] = crc8_update(0, &data[..8]);
        assert_eq!(crc8_update(0, &data), 0);
    }
}

#[test]
fn round_trip_verifies_for_random_payloads() {
    let mut gen = XorShift(1);
    for len in 1..=16usize {
        let mut payload = vec![0u8; len];
        gen.fill(&mut payload);
        let register = gen.next_byte();
        let address = gen.next_byte() & 0x7f;

        let mut frame = vec![0u8; frame_len(len, 1)];
        let seed = seed_address(address, DIR_WRITE);
        let n = prepare_frame(seed, register, &payload, None, &mut frame);
        assert_eq!(n, frame.len());
        assert!(verify_frame(seed, register, &frame, None));
    }
}

#[test]
fn any_single_bit_flip_fails_verification() {
    let seed = seed_address(0x42, DIR_WRITE);
    let mut frame = [0u8; 5];
    let n = prepare_frame(seed, 0x07, &[0x11, 0x22, 0x33, 0x44], None, &mut frame);
    assert_eq!(n, 5);

    for byte in 0..frame.len() {
        for bit in 0..8 {
            let mut corrupted = frame;
            corrupted[byte] ^= 1 << bit;
            assert!(
                !verify_frame(seed, 0x07, &corrupted, None),
                "flip of byte {} bit {} went undetected",
                byte,
                bit
            );
        }
    }
}

#[test]
fn verification_is_bound_to_address_and_register() {
    let seed = seed_address(0x08, DIR_READ);
    let mut frame = [0u8; 3];
    prepare_frame(seed, 0x10, &[0x01, 0x02], None, &mut frame);

    assert!(verify_frame(seed, 0x10, &frame, None));
    assert!(!verify_frame(seed, 0x11, &frame, None));
    assert!(!verify_frame(seed_address(0x09, DIR_READ), 0x10, &frame, None));
    assert!(!verify_frame(seed_address(0x08, DIR_WRITE), 0x10, &frame, None));
}

#[test]
fn continuation_registers_are_seeded_fresh() {
    // Burst of [2, 1] bytes: only the first register's checksum carries
    // the address/register prefix.
    let seed = seed_address(0x20, DIR_WRITE);
    let mut frame = [0u8; 5];
    let n = prepare_frame(seed, 0x40, &[0xaa, 0xbb, 0xcc], Some(&[2, 1]), &mut frame);
    assert_eq!(n, 5);

    let first = crc8_update(crc8_update(0, &[seed, 0x40]), &[0xaa, 0xbb]);
    let second = crc8_update(0, &[0xcc]);
    assert_eq!(&frame, &[0xaa, 0xbb, first, 0xcc, second]);
}

#[test]
fn burst_verification_checks_each_register() {
    let seed = seed_address(0x20, DIR_READ);
    let mut frame = [0u8; 8];
    let n = prepare_frame(
        seed,
        0x40,
        &[1, 2, 3, 4, 5],
        Some(&[2, 2, 1]),
        &mut frame,
    );
    assert_eq!(n, 8);
    assert!(verify_frame(seed, 0x40, &frame, Some(&[2, 2, 1])));

    // Corrupting any one register's checksum fails the whole frame even
    // though the others remain valid.
    for crc_pos in [2usize, 5, 7] {
        let mut corrupted = frame;
        corrupted[crc_pos] ^= 0x80;
        assert!(!verify_frame(seed, 0x40, &corrupted, Some(&[2, 2, 1])));
    }
}

#[test]
fn compaction_strips_interleaved_checksums() {
    let seed = seed_address(0x33, DIR_READ);
    let mut frame = [0u8; 7];
    prepare_frame(seed, 0x50, &[9, 8, 7, 6], Some(&[1, 2, 1]), &mut frame);

    let mut out = [0u8; 4];
    let n = compact_frame(&frame, Some(&[1, 2, 1]), &mut out);
    assert_eq!(n, 4);
    assert_eq!(out, [9, 8, 7, 6]);
}

#[test]
fn truncated_frames_are_rejected() {
    let seed = seed_address(0x08, DIR_READ);
    let mut frame = [0u8; 3];
    prepare_frame(seed, 0x10, &[0x01, 0x02], None, &mut frame);

    assert!(!verify_frame(seed, 0x10, &frame[..2], Some(&[2])));
    assert!(!verify_frame(seed, 0x10, &frame, Some(&[2, 1])));
}

#[test]
fn undersized_output_is_refused() {
    let mut out = [0u8; 2];
    let n = prepare_frame(
        seed_address(0x08, DIR_WRITE),
        0x10,
        &[1, 2],
        None,
        &mut out,
    );
    assert_eq!(n, 0);
    assert_eq!(out, [0, 0]);
}
