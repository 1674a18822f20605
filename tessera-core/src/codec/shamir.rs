//! Shamir secret sharing over GF(2^8)
//!
//! Used to split the per-blob encryption key. Each byte of the secret is the
//! constant term of an independent random polynomial of degree `k - 1`;
//! share `x` holds the evaluations at `x` (1..=n). Arithmetic uses the
//! Rijndael polynomial (x^8 + x^4 + x^3 + x + 1) with generator 3.
//!
//! Lookups are table driven and not constant time. Key shares are only ever
//! combined on the reading side after the ciphertext digest matched.

use rand::RngCore;

const fn build_tables() -> ([u8; 256], [u8; 256]) {
    let mut exp = [0u8; 256];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        let mut doubled = x << 1;
        if doubled & 0x100 != 0 {
            doubled ^= 0x11b;
        }
        x = doubled ^ x;
        i += 1;
    }
    exp[255] = exp[0];
    (exp, log)
}

const TABLES: ([u8; 256], [u8; 256]) = build_tables();
const EXP: [u8; 256] = TABLES.0;
const LOG: [u8; 256] = TABLES.1;

fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let idx = (LOG[a as usize] as usize + LOG[b as usize] as usize) % 255;
    EXP[idx]
}

/// `a / b`; `b` must be non-zero
fn div(a: u8, b: u8) -> u8 {
    debug_assert!(b != 0, "division by zero in GF(256)");
    if a == 0 {
        return 0;
    }
    let idx = (LOG[a as usize] as usize + 255 - LOG[b as usize] as usize) % 255;
    EXP[idx]
}

/// Evaluate the polynomial with the given coefficients (constant first) at `x`
fn evaluate(coefficients: &[u8], x: u8) -> u8 {
    coefficients
        .iter()
        .rev()
        .fold(0u8, |acc, &c| mul(acc, x) ^ c)
}

/// One share of a split secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShare {
    /// Evaluation point, never zero
    pub x: u8,
    /// One evaluation per secret byte
    pub y: Vec<u8>,
}

/// Split `secret` into `count` shares, any `threshold` of which recombine it
///
/// Callers guarantee `1 <= threshold <= count <= 255`.
pub fn split(secret: &[u8], threshold: usize, count: usize) -> Vec<KeyShare> {
    let mut rng = rand::rngs::OsRng;
    let mut shares: Vec<KeyShare> = (1..=count)
        .map(|x| KeyShare {
            x: x as u8,
            y: Vec::with_capacity(secret.len()),
        })
        .collect();

    let mut coefficients = vec![0u8; threshold];
    for &byte in secret {
        coefficients[0] = byte;
        rng.fill_bytes(&mut coefficients[1..]);
        for share in shares.iter_mut() {
            share.y.push(evaluate(&coefficients, share.x));
        }
    }
    coefficients.iter_mut().for_each(|c| *c = 0);

    shares
}

/// Recombine a secret via Lagrange interpolation at zero
///
/// Returns `None` if the shares are malformed (zero or duplicate evaluation
/// points, mismatched lengths). With fewer shares than the split threshold
/// the result is an unrelated value; callers verify it independently.
pub fn combine(shares: &[KeyShare]) -> Option<Vec<u8>> {
    let first = shares.first()?;
    let len = first.y.len();
    if shares.iter().any(|s| s.x == 0 || s.y.len() != len) {
        return None;
    }
    for (i, a) in shares.iter().enumerate() {
        if shares[i + 1..].iter().any(|b| b.x == a.x) {
            return None;
        }
    }

    // Lagrange basis values at zero: l_i = prod_{j != i} x_j / (x_i ^ x_j)
    let basis: Vec<u8> = shares
        .iter()
        .map(|si| {
            shares
                .iter()
                .filter(|sj| sj.x != si.x)
                .fold(1u8, |acc, sj| mul(acc, div(sj.x, si.x ^ sj.x)))
        })
        .collect();

    let secret = (0..len)
        .map(|byte| {
            shares
                .iter()
                .zip(&basis)
                .fold(0u8, |acc, (share, &l)| acc ^ mul(share.y[byte], l))
        })
        .collect();
    Some(secret)
}
