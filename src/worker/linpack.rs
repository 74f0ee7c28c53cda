//! LINPACK-style floating point benchmark.
//!
//! Factors a dense pseudo-random system with partial pivoting and solves it.
//! The right-hand side is built from row sums, so the exact solution is all
//! ones and the residual doubles as a correctness check.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Matrix order used when the coordinator requests a benchmark
pub const DEFAULT_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct LinpackReport {
    pub size: usize,
    pub seconds: f64,
    pub mflops: f64,
    /// Largest deviation of the solution from one
    pub residual: f64,
}

pub fn run(size: usize) -> LinpackReport {
    let n = size.max(1);
    let (mut a, mut b) = generate(n);

    let started = Instant::now();
    let pivots = factor(&mut a, n);
    solve(&a, n, &pivots, &mut b);
    let elapsed = started.elapsed().max(Duration::from_nanos(1));

    let nf = n as f64;
    let ops = 2.0 * nf * nf * nf / 3.0 + 2.0 * nf * nf;
    let seconds = elapsed.as_secs_f64();

    LinpackReport {
        size: n,
        seconds,
        mflops: ops / (seconds * 1.0e6),
        residual: b.iter().map(|x| (x - 1.0).abs()).fold(0.0, f64::max),
    }
}

/// Column-major matrix and its row sums.
fn generate(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut seed: u64 = 1325;
    let mut a = vec![0.0; n * n];
    for j in 0..n {
        for i in 0..n {
            seed = (3125 * seed) % 65536;
            a[i + j * n] = (seed as f64 - 32768.0) / 16384.0;
        }
    }

    let mut b = vec![0.0; n];
    for j in 0..n {
        for i in 0..n {
            b[i] += a[i + j * n];
        }
    }
    (a, b)
}

/// In-place LU factorisation with partial pivoting. Multipliers are stored
/// negated below the diagonal.
fn factor(a: &mut [f64], n: usize) -> Vec<usize> {
    let mut pivots = vec![0; n];

    for k in 0..n.saturating_sub(1) {
        let p = (k..n)
            .max_by(|&x, &y| {
                a[x + k * n]
                    .abs()
                    .partial_cmp(&a[y + k * n].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(k);
        pivots[k] = p;

        // singular column
        if a[p + k * n] == 0.0 {
            continue;
        }
        if p != k {
            a.swap(p + k * n, k + k * n);
        }

        let scale = -1.0 / a[k + k * n];
        for i in k + 1..n {
            a[i + k * n] *= scale;
        }

        for j in k + 1..n {
            let t = a[p + j * n];
            if p != k {
                a[p + j * n] = a[k + j * n];
                a[k + j * n] = t;
            }
            for i in k + 1..n {
                a[i + j * n] += t * a[i + k * n];
            }
        }
    }

    pivots[n - 1] = n - 1;
    pivots
}

fn solve(a: &[f64], n: usize, pivots: &[usize], b: &mut [f64]) {
    for k in 0..n.saturating_sub(1) {
        let l = pivots[k];
        let t = b[l];
        if l != k {
            b[l] = b[k];
            b[k] = t;
        }
        for i in k + 1..n {
            b[i] += t * a[i + k * n];
        }
    }

    for k in (0..n).rev() {
        b[k] /= a[k + k * n];
        let t = -b[k];
        for i in 0..k {
            b[i] += t * a[i + k * n];
        }
    }
}
