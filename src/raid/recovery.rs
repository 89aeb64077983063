//! RAID6 P/Q reconstruction over GF(2^8), generator polynomial 0x11d.
//!
//! Data members of a row are numbered by their position `j` after the Q
//! member; `P = xor(D_j)` and `Q = xor(g^j * D_j)` with `g = 2`.  One
//! missing data member is rebuilt from P (or from Q when P is unreadable);
//! two are solved from both.

use log::warn;

use crate::error::{zeroed_buf, Result, VfsError};

// ── GF(2^8) tables ───────────────────────────────────────────────────────────

/// `POW[i] = g^i`, repeated over a second period so sums of two logs index
/// without a modulo.
pub(crate) const POW: [u8; 510] = {
    let mut table = [0u8; 510];
    let mut val: u16 = 1;
    let mut i = 0;
    while i < 255 {
        table[i] = val as u8;
        table[i + 255] = val as u8;
        val <<= 1;
        if val & 0x100 != 0 {
            val ^= 0x11d;
        }
        i += 1;
    }
    table
};

/// Discrete log: `INVPOW[POW[i]] = i`.  `INVPOW[0]` is unused.
pub(crate) const INVPOW: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 255 {
        table[POW[i] as usize] = i as u8;
        i += 1;
    }
    table
};

/// Fold an exponent sum into `0..255`; 255 is the identity exponent 0.
pub(crate) fn mod_255(mut x: usize) -> usize {
    while x > 0xff {
        x = (x >> 8) + (x & 0xff);
    }
    if x == 0xff { 0 } else { x }
}

/// Multiply every byte of `buf` by `g^mul`.
pub(crate) fn mulx(mul: usize, buf: &mut [u8]) {
    for b in buf.iter_mut().filter(|b| **b != 0) {
        *b = POW[mul + INVPOW[*b as usize] as usize];
    }
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

// ── Syndromes ────────────────────────────────────────────────────────────────

/// P and Q for one row of equally sized data stripes given in member order.
pub fn syndromes(data: &[&[u8]]) -> (Vec<u8>, Vec<u8>) {
    let len = data.first().map_or(0, |d| d.len());
    let mut p = vec![0u8; len];
    let mut q = vec![0u8; len];
    let mut scratch = vec![0u8; len];
    for (j, stripe) in data.iter().enumerate() {
        xor_into(&mut p, stripe);
        scratch.copy_from_slice(stripe);
        mulx(j, &mut scratch);
        xor_into(&mut q, &scratch);
    }
    (p, q)
}

// ── Recovery ─────────────────────────────────────────────────────────────────

/// A row member as seen by the recovery engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member {
    /// Data stripe at position `j` after Q.
    Data(usize),
    P,
    Q,
}

/// Rebuild data stripe `bad` of a row with `ndata` data members into `buf`.
///
/// `read` fetches one member's stripe for the same sector range; any error
/// marks that member bad.  A second bad data member is solved together with
/// `bad`; a third, or a missing P/Q when it is needed, fails with
/// [`VfsError::TooManyBadDevices`].
pub fn recover(
    ndata: usize,
    bad:   usize,
    buf:   &mut [u8],
    read:  &mut dyn FnMut(Member, &mut [u8]) -> Result<()>,
) -> Result<()> {
    if ndata == 0 || ndata > 253 || bad >= ndata {
        return Err(VfsError::BadDevice(format!("bad stripe {bad} of {ndata}")));
    }
    let len = buf.len();
    let mut pbuf = zeroed_buf(len)?;
    let mut qbuf = zeroed_buf(len)?;
    let mut tmp = zeroed_buf(len)?;

    let mut other = None;
    for j in (0..ndata).filter(|&j| j != bad) {
        match read(Member::Data(j), &mut tmp) {
            Ok(()) => {
                xor_into(&mut pbuf, &tmp);
                mulx(j, &mut tmp);
                xor_into(&mut qbuf, &tmp);
            }
            Err(e) => {
                if other.is_some() {
                    return Err(VfsError::TooManyBadDevices);
                }
                warn!("raid6: data stripe {j} also unreadable: {e}");
                other = Some(j);
            }
        }
    }

    match other {
        None => {
            match read(Member::P, buf) {
                Ok(()) => {
                    xor_into(buf, &pbuf);
                    return Ok(());
                }
                Err(e) => warn!("raid6: P unreadable, using Q: {e}"),
            }
            read(Member::Q, buf).map_err(|_| VfsError::TooManyBadDevices)?;
            xor_into(buf, &qbuf);
            mulx(255 - bad, buf);
        }
        Some(b) => {
            let a = bad;
            read(Member::P, &mut tmp).map_err(|_| VfsError::TooManyBadDevices)?;
            xor_into(&mut pbuf, &tmp);
            read(Member::Q, &mut tmp).map_err(|_| VfsError::TooManyBadDevices)?;
            xor_into(&mut qbuf, &tmp);

            // D_a = g^c * Q' ^ g^(b+c) * P'  with  g^c = 1 / (g^a * (g^(b-a) ^ 1)).
            let c = mod_255((255 - a) + (255 - INVPOW[(POW[b + 255 - a] ^ 1) as usize] as usize));
            mulx(c, &mut qbuf);
            mulx(mod_255(b + c), &mut pbuf);
            xor_into(&mut pbuf, &qbuf);
            buf.copy_from_slice(&pbuf);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row(ndata: usize, len: usize) -> Vec<Vec<u8>> {
        (0..ndata)
            .map(|j| (0..len).map(|i| (i * 31 + j * 97 + 7) as u8).collect())
            .collect()
    }

    fn reader<'a>(
        data: &'a [Vec<u8>],
        p:    &'a [u8],
        q:    &'a [u8],
        dead: &'a [Member],
    ) -> impl FnMut(Member, &mut [u8]) -> Result<()> + 'a {
        move |m, out| {
            if dead.contains(&m) {
                return Err(VfsError::Read(format!("{m:?} is dead")));
            }
            out.copy_from_slice(match m {
                Member::Data(j) => data[j].as_slice(),
                Member::P => p,
                Member::Q => q,
            });
            Ok(())
        }
    }

    #[test]
    fn field_tables() {
        assert_eq!(POW[0], 1);
        assert_eq!(POW[1], 2);
        assert_eq!(POW[8], 0x1d);
        assert_eq!(POW[255], 1);
        for v in 1..=255u8 {
            assert_eq!(POW[INVPOW[v as usize] as usize], v);
        }
    }

    #[test]
    fn exponent_folding() {
        assert_eq!(mod_255(0), 0);
        assert_eq!(mod_255(254), 254);
        assert_eq!(mod_255(255), 0);
        assert_eq!(mod_255(256), 1);
        assert_eq!(mod_255(510), 0);
    }

    #[test]
    fn known_syndrome_vector() {
        // Single-byte stripes 1, 2, 3: Q = 1 ^ 2*2 ^ 4*3 = 1 ^ 4 ^ 12.
        let stripes: [&[u8]; 3] = [&[1], &[2], &[3]];
        let (p, q) = syndromes(&stripes);
        assert_eq!(p, [1 ^ 2 ^ 3]);
        assert_eq!(q, [1 ^ 4 ^ 12]);
    }

    #[test]
    fn recovers_every_single_member() {
        let data = row(6, 64);
        let refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
        let (p, q) = syndromes(&refs);
        for bad in 0..6 {
            for dead in [vec![Member::Data(bad)], vec![Member::Data(bad), Member::P]] {
                let mut buf = vec![0u8; 64];
                recover(6, bad, &mut buf, &mut reader(&data, &p, &q, &dead)).unwrap();
                assert_eq!(buf, data[bad], "bad={bad} dead={dead:?}");
            }
        }
    }

    #[test]
    fn recovers_every_pair() {
        let data = row(5, 48);
        let refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
        let (p, q) = syndromes(&refs);
        for a in 0..5 {
            for b in (0..5).filter(|&b| b != a) {
                let dead = [Member::Data(a), Member::Data(b)];
                let mut buf = vec![0u8; 48];
                recover(5, a, &mut buf, &mut reader(&data, &p, &q, &dead)).unwrap();
                assert_eq!(buf, data[a], "a={a} b={b}");
            }
        }
    }

    #[test]
    fn third_failure_is_fatal() {
        let data = row(4, 16);
        let refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
        let (p, q) = syndromes(&refs);
        let mut buf = vec![0u8; 16];

        let dead = [Member::Data(0), Member::Data(1), Member::Data(2)];
        let err = recover(4, 0, &mut buf, &mut reader(&data, &p, &q, &dead)).unwrap_err();
        assert!(matches!(err, VfsError::TooManyBadDevices));

        let dead = [Member::Data(0), Member::Data(3), Member::Q];
        let err = recover(4, 0, &mut buf, &mut reader(&data, &p, &q, &dead)).unwrap_err();
        assert!(matches!(err, VfsError::TooManyBadDevices));

        let dead = [Member::Data(2), Member::P, Member::Q];
        let err = recover(4, 2, &mut buf, &mut reader(&data, &p, &q, &dead)).unwrap_err();
        assert!(matches!(err, VfsError::TooManyBadDevices));
    }

    fn random_row() -> impl Strategy<Value = Vec<Vec<u8>>> {
        (2usize..10, 1usize..64).prop_flat_map(|(ndata, len)| {
            prop::collection::vec(prop::collection::vec(any::<u8>(), len), ndata)
        })
    }

    proptest! {
        #[test]
        fn recovers_random_rows(data in random_row(), bad_seed in any::<usize>(), other_seed in any::<usize>()) {
            let ndata = data.len();
            let bad = bad_seed % ndata;
            // Second lost member: another data stripe, P, Q, or none when it
            // lands on `bad` itself.
            let mut dead = vec![Member::Data(bad)];
            match other_seed % (ndata + 2) {
                k if k == bad => {}
                k if k < ndata => dead.push(Member::Data(k)),
                k if k == ndata => dead.push(Member::P),
                _ => dead.push(Member::Q),
            }

            let refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
            let (p, q) = syndromes(&refs);
            let mut buf = vec![0u8; data[0].len()];
            recover(ndata, bad, &mut buf, &mut reader(&data, &p, &q, &dead)).unwrap();
            prop_assert_eq!(&buf, &data[bad], "dead {:?}", dead);
        }
    }
}
