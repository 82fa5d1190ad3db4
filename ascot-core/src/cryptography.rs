//! Cryptographic Methods
//!
//! These are the parts of the Bluetooth *cryptographic toolbox* (Bluetooth Specification v5.0 |
//! Vol 3, Part H, section 2.2) needed by a bond manager. Everything is calculated within software,
//! no hardware peripheral is used except for the systems random number generator. Cryptographic
//! functions not defined by the Bluetooth Specification come from the
//! [Rust Crypto group](https://github.com/RustCrypto).
//!
//! # Note
//! All `u128` inputs and outputs are in big-endian order, matching how the specification presents
//! its sample data.

/// 24-bit hash function
///
/// Used in resolvable private address creation and resolution. Both `r` (the *prand*) and the
/// return (the *hash*) are in the little endian order they appear within a device address.
pub fn ah(k: u128, r: [u8; 3]) -> [u8; 3] {
    let r_padded = <u128>::from(r[0]) | <u128>::from(r[1]) << (1 * 8) | <u128>::from(r[2]) << (2 * 8);

    let cypher_text = e(k, r_padded);

    [cypher_text as u8, (cypher_text >> 8) as u8, (cypher_text >> 16) as u8]
}

/// Security function *e*
///
/// This is the 128-bit data generator used by the rest of the toolbox. It encrypts the 128-bit
/// `plain_text` with a 128-bit `key` using the AES-128 block cypher
/// (see [FIPS-197](https://en.wikipedia.org/wiki/FIPS_197)).
///
/// # Note
/// A new AES cypher is initialized on every call, so this function is not intended for bulk
/// encryption. Its purpose is the toolbox calculations of pairing and address resolution.
pub fn e(key: u128, plain_text: u128) -> u128 {
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{BlockEncrypt, KeyInit};

    let key_bytes = key.to_be_bytes();

    let cipher = aes::Aes128::new(GenericArray::from_slice(&key_bytes));

    let mut block = plain_text.to_be_bytes();

    cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));

    <u128>::from_be_bytes(block)
}

/// Legacy pairing confirm value function *c1*
///
/// # Inputs
/// - k: AES key (the TK)
/// - r: plain text random
/// - pres: 7 bytes, the pairing response command
/// - preq: 7 bytes, the pairing request command
/// - iat: 1 bit, the initiating device address type
/// - ia: 6 bytes, the initiating device address
/// - rat: 1 bit, the responding device address type
/// - ra: 6 bytes, the responding device address
///
/// ## Note
/// All inputs are masked down to the size stated above
pub fn c1(k: u128, r: u128, pres: u128, preq: u128, iat: bool, ia: u128, rat: bool, ra: u128) -> u128 {
    let p1 = c1_p1(pres, preq, iat, rat);

    let p2 = c1_p2(ia, ra);

    e(k, e(k, r ^ p1) ^ p2)
}

fn c1_p1(pres: u128, preq: u128, iat: bool, rat: bool) -> u128 {
    let iat_p = if iat { 1 } else { 0 };
    let rat_p = (if rat { 1 } else { 0 }) << (1 * 8);

    let pres_m = (0xFF_FFFF_FFFF_FFFF & pres) << (9 * 8);
    let preq_m = (0xFF_FFFF_FFFF_FFFF & preq) << (2 * 8);

    pres_m | preq_m | rat_p | iat_p
}

fn c1_p2(ia: u128, ra: u128) -> u128 {
    let ia_p = (0xFFFF_FFFF_FFFF & ia) << (6 * 8);
    let ra_p = 0xFFFF_FFFF_FFFF & ra;

    ia_p | ra_p
}

/// Legacy pairing short term key (STK) function *s1*
pub fn s1(k: u128, r1: u128, r2: u128) -> u128 {
    let r1_p = (0x0000_0000_0000_0000_FFFF_FFFF_FFFF_FFFF & r1) << 64;
    let r2_p = 0x0000_0000_0000_0000_FFFF_FFFF_FFFF_FFFF & r2;

    e(k, r1_p | r2_p)
}

/// AES-CMAC subkey generation algorithm
///
/// Derived from [The AES-CMAC Algorithm](https://datatracker.ietf.org/doc/rfc4493)
fn aes_cmac_subkey_gen(k: u128) -> (u128, u128) {
    const RB: u128 = 0x87;

    let l = e(k, 0);

    let k1 = if (l & (1 << 127)) == 0 { l << 1 } else { (l << 1) ^ RB };

    let k2 = if (k1 & (1 << 127)) == 0 {
        k1 << 1
    } else {
        (k1 << 1) ^ RB
    };

    (k1, k2)
}

fn aes_cmac_padding(r: &[u8]) -> u128 {
    let unpad = r
        .iter()
        .enumerate()
        .fold(0u128, |p, (i, v)| p | (<u128>::from(*v) << (8 * (15 - i))));

    unpad | (1 << (127 - (8 * r.len())))
}

/// Convert a slice of *plain text* with a length of 16 into a u128, big endian value.
fn to_u128_be(chunk_16_bytes: &[u8]) -> u128 {
    let mut c = [0u8; 16];

    c.clone_from_slice(chunk_16_bytes);

    <u128>::from_be_bytes(c)
}

/// AES-CMAC algorithm
///
/// This algorithm takes an AES-128 key along with a message in order to generate an authentication
/// code for the message. Within Bluetooth it is the signature algorithm for signed writes.
///
/// This method is derived from [The AES-CMAC Algorithm](https://datatracker.ietf.org/doc/rfc4493).
pub fn aes_cmac_generate(key: u128, msg: &[u8]) -> u128 {
    let (k1, k2) = aes_cmac_subkey_gen(key);

    let mut chunks = msg.chunks(16);

    // Every chunk except the final one is folded into x. The final chunk is handled below as it
    // is the one the subkeys apply to. An empty message still has a "final" (empty) chunk.
    let last = match chunks.next_back() {
        Some(last) => last,
        None => &[],
    };

    let x = chunks.fold(0u128, |x, chunk| e(key, x ^ to_u128_be(chunk)));

    let y = if last.len() == 16 {
        to_u128_be(last) ^ k1 ^ x
    } else {
        aes_cmac_padding(last) ^ k2 ^ x
    };

    e(key, y)
}

/// Verification for AES-CMAC
///
/// This method is used for verifying an `auth_code` given the `msg` and secret `key`.
pub fn aes_cmac_verify(key: u128, msg: &[u8], auth_code: u128) -> bool {
    auth_code == aes_cmac_generate(key, msg)
}

/// Generate a random `u128` value
#[cfg(feature = "sys-rand")]
pub fn rand_u128() -> u128 {
    use rand_core::{OsRng, RngCore};

    let mut bytes = [0u8; 16];

    OsRng.fill_bytes(&mut bytes);

    <u128>::from_ne_bytes(bytes)
}

/// Generate a nonce
#[cfg(feature = "sys-rand")]
pub fn nonce() -> u128 {
    rand_u128()
}

/// Tests
///
/// Much of the tests data can be retrieved from the end of the Security Manager specification,
/// but some of the tests data is unique.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_cmac_padding_test() {
        let b = [0x11, 0x22, 0x33];

        assert_eq!(0x1122_3380_0000_0000_0000_0000_0000_0000u128, aes_cmac_padding(&b));
    }

    /// The tests data was retrieved from [The AES-CMAC Algorithm](https://datatracker.ietf.org/doc/rfc4493)
    #[test]
    fn aes_cmac_subkey_gen_test() {
        let k = 0x2b7e1516_28aed2a6_abf71588_09cf4f3c;

        assert_eq!(0x7df76b0c_1ab899b3_3e42f047_b91b546f, e(k, 0));

        let (k1, k2) = aes_cmac_subkey_gen(k);

        assert_eq!(0xfbeed618_35713366_7c85e08f_7236a8de, k1);
        assert_eq!(0xf7ddac30_6ae266cc_f90bc11e_e46d513b, k2);
    }

    /// This tests data was retrieved from [The AES-CMAC Algorithm](https://datatracker.ietf.org/doc/rfc4493)
    #[test]
    fn aes_cmac_gen_test() {
        let k = 0x2b7e1516_28aed2a6_abf71588_09cf4f3c;

        let m = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17, 0x2a, 0xae, 0x2d,
            0x8a, 0x57, 0x1e, 0x03, 0xac, 0x9c, 0x9e, 0xb7, 0x6f, 0xac, 0x45, 0xaf, 0x8e, 0x51, 0x30, 0xc8, 0x1c, 0x46,
            0xa3, 0x5c, 0xe4, 0x11, 0xe5, 0xfb, 0xc1, 0x19, 0x1a, 0x0a, 0x52, 0xef, 0xf6, 0x9f, 0x24, 0x45, 0xdf, 0x4f,
            0x9b, 0x17, 0xad, 0x2b, 0x41, 0x7b, 0xe6, 0x6c, 0x37, 0x10,
        ];

        assert_eq!(0xbb1d6929_e9593728_7fa37d12_9b756746, aes_cmac_generate(k, &m[..0]));
        assert_eq!(0x070a16b4_6b4d4144_f79bdd9d_d04a287c, aes_cmac_generate(k, &m[..16]));
        assert_eq!(0xdfa66747_de9ae630_30ca3261_1497c827, aes_cmac_generate(k, &m[..40]));
        assert_eq!(0x51f0bebf_7e3b9d92_fc497417_79363cfe, aes_cmac_generate(k, &m));

        assert!(aes_cmac_verify(k, &m[..16], 0x070a16b4_6b4d4144_f79bdd9d_d04a287c));
        assert!(!aes_cmac_verify(k, &m[..16], 0x070a16b4_6b4d4144_f79bdd9d_d04a287d));
    }

    /// Sample data from the Bluetooth Specification (v5.0 | Vol 3, Part H, Appendix D.7)
    #[test]
    fn ah_test() {
        let irk = 0xec0234a3_57c8ad05_341010a6_0a397d9b;

        // prand of 0x708194, little endian within an address
        let prand = [0x94, 0x81, 0x70];

        // hash of 0x0dfbaa, little endian within an address
        assert_eq!([0xaa, 0xfb, 0x0d], ah(irk, prand));
    }

    #[test]
    fn c1_test() {
        let k = 0;
        let r = 0x5783D52156AD6F0E6388274EC6702EE0;
        let pres = 0x05000800000302;
        let preq = 0x07071000000101;
        let iat = true;
        let rat = false;
        let ia = 0xA1A2A3A4A5A6;
        let ra = 0xB1B2B3B4B5B6;

        assert_eq!(0x05000800000302070710000001010001, c1_p1(pres, preq, iat, rat));

        assert_eq!(0x00000000A1A2A3A4A5A6B1B2B3B4B5B6, c1_p2(ia, ra));

        assert_eq!(
            0x1e1e3fef878988ead2a74dc5bef13b86u128,
            c1(k, r, pres, preq, iat, ia, rat, ra)
        );
    }

    #[test]
    fn s1_test() {
        let k = 0;
        let r1 = 0x000F0E0D0C0B0A091122334455667788;
        let r2 = 0x010203040506070899AABBCCDDEEFF00;

        assert_eq!(0x9a1fe1f0e8b0f49b5b4216ae796da062, s1(k, r1, r2));
    }
}
