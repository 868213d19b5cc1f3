use super::{gf_inv, gf_mul, gf_pow, gf_sub, GF_MAX_VAL};
use crate::{SlimeError, SlimeResult, MAX_CHUNKS};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

static PARITY_MATRICES: Lazy<Mutex<HashMap<(usize, usize), Arc<ParityMatrix>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub type Matrix = Vec<Vec<u32>>;

/// A `total x need` encoding matrix. The first `need` rows are the identity,
/// so data chunks are stored verbatim; every other row produces one parity
/// chunk. Any `need` rows form an invertible matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParityMatrix {
    pub need: usize,
    pub total: usize,
    rows: Matrix,
}

/// Memoized by `(need, total)`.
pub fn parity_matrix(need: usize, total: usize) -> SlimeResult<Arc<ParityMatrix>> {
    if need == 0 || need > total || total > MAX_CHUNKS {
        return Err(SlimeError::BadArgument(format!(
            "invalid redundancy need={} total={}",
            need, total
        )));
    }

    let mut cache = PARITY_MATRICES
        .lock()
        .map_err(|_| SlimeError::Internal("parity matrix cache poisoned".to_string()))?;
    if let Some(m) = cache.get(&(need, total)) {
        return Ok(m.clone());
    }
    let m = Arc::new(ParityMatrix::build(need, total)?);
    cache.insert((need, total), m.clone());
    Ok(m)
}

impl ParityMatrix {
    fn build(need: usize, total: usize) -> SlimeResult<Self> {
        // Vandermonde rows x^0..x^(need-1) for distinct x = 0..total; any
        // `need` of them are independent. Right-multiplying by the inverse of
        // the top block keeps that property and turns the top into identity.
        let vandermonde: Matrix = (0..total)
            .map(|x| (0..need).map(|j| gf_pow(x as u32, j as u64)).collect())
            .collect();
        let top_inv = invert(&vandermonde[..need].to_vec())?;
        let rows = multiply(&vandermonde, &top_inv);
        Ok(Self { need, total, rows })
    }

    pub fn row(&self, index: usize) -> &[u32] {
        &self.rows[index]
    }

    /// Apply row `index` to the data vectors, writing into `out`.
    pub fn create_parity(
        &self,
        data: &[Vec<u32>],
        index: usize,
        out: &mut Vec<u32>,
    ) -> SlimeResult<()> {
        if index >= self.total || data.len() != self.need {
            return Err(SlimeError::BadArgument(format!(
                "create_parity: index {} with {} data vectors for {}/{}",
                index,
                data.len(),
                self.need,
                self.total
            )));
        }
        let width = data.first().map(|v| v.len()).unwrap_or(0);
        out.clear();
        out.resize(width, 0);
        apply_row(&self.rows[index], data, out);
        Ok(())
    }

    /// Recover the `need` data vectors from any `need` surviving vectors.
    /// `indices[i]` is the row that produced `surviving[i]`.
    pub fn recover_data(
        &self,
        surviving: &[Vec<u32>],
        indices: &[usize],
    ) -> SlimeResult<Vec<Vec<u32>>> {
        if surviving.len() != indices.len() {
            return Err(SlimeError::BadArgument(
                "recover_data: vectors and indices differ in length".to_string(),
            ));
        }
        if surviving.len() < self.need {
            return Err(SlimeError::InsufficientChunks(format!(
                "have {} of {} chunks",
                surviving.len(),
                self.need
            )));
        }
        if let Some(bad) = indices.iter().find(|i| **i >= self.total) {
            return Err(SlimeError::BadArgument(format!(
                "recover_data: index {} out of range",
                bad
            )));
        }

        let surviving = &surviving[..self.need];
        let indices = &indices[..self.need];
        let width = surviving[0].len();
        if surviving.iter().any(|v| v.len() != width) {
            return Err(SlimeError::BadArgument(
                "recover_data: vectors differ in width".to_string(),
            ));
        }

        let sub: Matrix = indices.iter().map(|i| self.rows[*i].clone()).collect();
        let inv = invert(&sub)?;
        let mut out = Vec::with_capacity(self.need);
        for row in inv.iter() {
            let mut v = vec![0u32; width];
            apply_row(row, surviving, &mut v);
            out.push(v);
        }
        Ok(out)
    }
}

fn apply_row(row: &[u32], data: &[Vec<u32>], out: &mut [u32]) {
    for (k, slot) in out.iter_mut().enumerate() {
        let mut acc = 0u64;
        for (coef, vec) in row.iter().zip(data.iter()) {
            acc += gf_mul(*coef, vec[k]) as u64;
        }
        *slot = (acc % GF_MAX_VAL as u64) as u32;
    }
}

pub fn multiply(a: &Matrix, b: &Matrix) -> Matrix {
    let cols = b.first().map(|r| r.len()).unwrap_or(0);
    a.iter()
        .map(|row| {
            (0..cols)
                .map(|c| {
                    let mut acc = 0u64;
                    for (k, x) in row.iter().enumerate() {
                        acc += gf_mul(*x, b[k][c]) as u64;
                    }
                    (acc % GF_MAX_VAL as u64) as u32
                })
                .collect()
        })
        .collect()
}

/// Gauss-Jordan inversion of a square matrix.
pub fn invert(m: &Matrix) -> SlimeResult<Matrix> {
    let n = m.len();
    if m.iter().any(|r| r.len() != n) {
        return Err(SlimeError::BadArgument("invert: matrix not square".to_string()));
    }

    let mut a = m.clone();
    let mut inv: Matrix = (0..n)
        .map(|i| (0..n).map(|j| u32::from(i == j)).collect())
        .collect();

    for col in 0..n {
        let pivot = (col..n)
            .find(|r| a[*r][col] != 0)
            .ok_or_else(|| SlimeError::BadArgument("invert: singular matrix".to_string()))?;
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let scale = gf_inv(a[col][col]);
        for j in 0..n {
            a[col][j] = gf_mul(a[col][j], scale);
            inv[col][j] = gf_mul(inv[col][j], scale);
        }

        for r in 0..n {
            if r == col || a[r][col] == 0 {
                continue;
            }
            let factor = a[r][col];
            for j in 0..n {
                a[r][j] = gf_sub(a[r][j], gf_mul(factor, a[col][j]));
                inv[r][j] = gf_sub(inv[r][j], gf_mul(factor, inv[col][j]));
            }
        }
    }
    Ok(inv)
}
