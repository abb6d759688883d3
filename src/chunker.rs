use std::io::{self, Read};

use rand::{thread_rng, Rng};
use rustic_cdc::{Polynom, Polynom64, Rabin64, RollingHash64};

use crate::{archiver::buffer_pool::BufferPool, error::ChunkerErrorKind, PackratResult};

pub(super) mod constants {
    /// The window size used by the rolling hash, in bytes
    pub(super) const WINDOW_SIZE: usize = 64;
    /// Number of bits in the splitmask; a boundary is cut when the lowest 20 bits of the hash are zero
    pub(super) const SPLITMASK: u64 = (1u64 << 20) - 1;
    /// 1 kiB
    pub(super) const KB: usize = 1024;
    /// 1 MiB
    pub(super) const MB: usize = 1024 * KB;
    /// The minimal chunk size
    pub(crate) const MIN_SIZE: usize = 512 * KB;
    /// The maximal chunk size
    pub(crate) const MAX_SIZE: usize = 8 * MB;
    /// The size of the internal read buffer
    pub(super) const READ_BUF_SIZE: usize = 4 * KB;
}

#[inline]
const fn default_predicate(x: u64) -> bool {
    (x & constants::SPLITMASK) == 0
}

/// `ChunkIter` chunks the contents of a reader into content-defined chunks.
///
/// Chunk boundaries are determined by a rolling Rabin fingerprint over the
/// repository's polynomial, bounded by a minimal and maximal chunk size.
/// Chunk buffers are drawn from the given [`BufferPool`]; ownership of every
/// returned buffer moves to the caller.
pub(crate) struct ChunkIter<'pool, R: Read> {
    buf: Vec<u8>,
    pos: usize,
    reader: R,
    predicate: fn(u64) -> bool,
    rabin: Rabin64,
    pool: &'pool BufferPool,
    size_hint: usize,
    min_size: usize,
    max_size: usize,
    finished: bool,
}

impl<'pool, R: Read> ChunkIter<'pool, R> {
    pub(crate) fn new(reader: R, size_hint: usize, rabin: Rabin64, pool: &'pool BufferPool) -> Self {
        Self {
            buf: Vec::with_capacity(constants::READ_BUF_SIZE),
            pos: 0,
            reader,
            predicate: default_predicate,
            rabin,
            pool,
            size_hint,
            min_size: constants::MIN_SIZE,
            max_size: constants::MAX_SIZE,
            finished: false,
        }
    }
}

impl<R: Read> Iterator for ChunkIter<'_, R> {
    type Item = PackratResult<Vec<u8>>;

    fn next(&mut self) -> Option<PackratResult<Vec<u8>>> {
        if self.finished {
            return None;
        }

        let mut min_size = self.min_size;
        let mut vec = self.pool.get();
        vec.reserve(self.size_hint.min(min_size));

        // check if some bytes exist in the buffer and if yes, use them
        let open_buf_len = self.buf.len() - self.pos;
        if open_buf_len > 0 {
            vec.extend_from_slice(&self.buf[self.pos..]);
            self.pos = self.buf.len();
            min_size -= open_buf_len;
        }

        let size = match (&mut self.reader)
            .take(min_size as u64)
            .read_to_end(&mut vec)
        {
            Ok(size) => size,
            Err(err) => return Some(Err(ChunkerErrorKind::FromIoError(err).into())),
        };

        // If self.min_size is not reached, we are done.
        // Note that the read data is of size size + open_buf_len and self.min_size = min_size + open_buf_len
        if size < min_size {
            self.finished = true;
            if vec.is_empty() {
                self.pool.put(vec);
                return None;
            }
            return Some(Ok(vec));
        }

        self.rabin.reset_and_prefill_window(
            &mut vec[vec.len() - constants::WINDOW_SIZE..vec.len()]
                .iter()
                .copied(),
        );

        loop {
            if vec.len() >= self.max_size {
                break;
            }

            if self.buf.len() == self.pos {
                self.buf.resize(constants::READ_BUF_SIZE, 0);
                match self.reader.read(&mut self.buf[..]) {
                    Ok(0) => {
                        self.finished = true;
                        break;
                    }
                    Ok(size) => {
                        self.pos = 0;
                        self.buf.truncate(size);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        return Some(Err(ChunkerErrorKind::FromIoError(e).into()));
                    }
                }
            }

            let byte = self.buf[self.pos];
            vec.push(byte);
            self.pos += 1;
            self.rabin.slide(byte);
            if (self.predicate)(*self.rabin.get_hash()) {
                break;
            }
        }
        self.size_hint = self.size_hint.saturating_sub(vec.len());
        Some(Ok(vec))
    }
}

/// `random_poly` returns a random irreducible polynomial of degree 53
/// (largest prime number below 64-8)
///
/// There are (2^53-2/53) irreducible polynomials of degree 53 in
/// F_2\[X\], c.f. Michael O. Rabin (1981): "Fingerprinting by Random
/// Polynomials", page 4.
///
/// # Errors
///
/// * [`ChunkerErrorKind::NoSuitablePolynomialFound`] - If no polynomial could be found in one million tries.
///
/// [`ChunkerErrorKind::NoSuitablePolynomialFound`]: crate::error::ChunkerErrorKind::NoSuitablePolynomialFound
pub fn random_poly() -> PackratResult<u64> {
    const RAND_POLY_MAX_TRIES: i32 = 1_000_000;

    for _ in 0..RAND_POLY_MAX_TRIES {
        let mut poly: u64 = thread_rng().gen();

        // mask away bits above bit 53
        poly &= (1 << 54) - 1;

        // set highest and lowest bit so that the degree is 53 and the
        // polynomial is not trivially reducible
        poly |= (1 << 53) | 1;

        if poly.irreducible() {
            return Ok(poly);
        }
    }
    Err(ChunkerErrorKind::NoSuitablePolynomialFound.into())
}

trait PolynomExtend {
    fn irreducible(&self) -> bool;
    fn gcd(&self, other: &Self) -> Self;
    fn add(&self, other: &Self) -> Self;
    fn mulmod(&self, other: &Self, modulo: &Self) -> Self;
}

// implementation goes along the lines of
// https://github.com/restic/chunker/blob/master/polynomials.go
impl PolynomExtend for Polynom64 {
    // Irreducible returns true iff x is irreducible over F_2. This function
    // uses Ben Or's reducibility test.
    //
    // For details see "Tests and Constructions of Irreducible Polynomials over
    // Finite Fields".
    fn irreducible(&self) -> bool {
        for i in 1..=self.degree() / 2 {
            if self.gcd(&qp(i, self)) != 1 {
                return false;
            }
        }
        true
    }

    fn gcd(&self, other: &Self) -> Self {
        if other == &0 {
            return *self;
        }

        if self == &0 {
            return *other;
        }

        if self.degree() < other.degree() {
            self.gcd(&other.modulo(self))
        } else {
            other.gcd(&self.modulo(other))
        }
    }

    fn add(&self, other: &Self) -> Self {
        *self ^ *other
    }

    fn mulmod(&self, other: &Self, modulo: &Self) -> Self {
        if self == &0 || other == &0 {
            return 0;
        }

        let mut res: Polynom64 = 0;
        let mut a = *self;
        let mut b = *other;

        if b & 1 > 0 {
            res = res.add(&a).modulo(modulo);
        }

        while b != 0 {
            a = (a << 1).modulo(modulo);
            b >>= 1;
            if b & 1 > 0 {
                res = res.add(&a).modulo(modulo);
            }
        }

        res
    }
}

// qp computes the polynomial (x^(2^p)-x) mod g. This is needed for the
// reducibility test.
fn qp(p: i32, g: &Polynom64) -> Polynom64 {
    // start with x
    let mut res: Polynom64 = 2;

    for _ in 0..p {
        // repeatedly square res
        res = res.mulmod(&res, g);
    }

    // add x
    res.add(&2).modulo(g)
}

#[cfg(test)]
mod tests {
    use super::*;

    // a known irreducible polynomial of degree 53, as e.g. generated by random_poly
    const TEST_POLY: u64 = 0x3DA3358B4DC173;

    fn chunk(data: &[u8]) -> Vec<Vec<u8>> {
        let pool = BufferPool::new(4, constants::MAX_SIZE);
        let rabin = Rabin64::new_with_polynom(6, &TEST_POLY);
        ChunkIter::new(data, data.len(), rabin, &pool)
            .collect::<PackratResult<_>>()
            .unwrap()
    }

    #[test]
    fn test_random_poly_has_degree_53_passes() {
        let poly = random_poly().unwrap();

        assert_eq!(poly.degree(), 53);
        assert_eq!(poly & 1, 1);
    }

    #[test]
    fn test_chunk_empty_input_yields_no_chunks_passes() {
        assert!(chunk(b"").is_empty());
    }

    #[test]
    fn test_chunk_small_input_yields_one_chunk_passes() {
        let chunks = chunk(b"foobar");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], b"foobar");
    }

    #[test]
    fn test_chunks_concatenate_to_input_passes() {
        // incompressible pseudo-random data, long enough to force several chunks
        let mut data = Vec::with_capacity(24 * constants::MB);
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..24 * constants::MB {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            data.push((state >> 33) as u8);
        }

        let chunks = chunk(&data);

        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert!(c.len() <= constants::MAX_SIZE);
            if i + 1 < chunks.len() {
                assert!(c.len() >= constants::MIN_SIZE);
            }
        }
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_chunking_is_deterministic_passes() {
        let data = vec![0u8; 2 * constants::MB];

        assert_eq!(chunk(&data), chunk(&data));
    }
}
