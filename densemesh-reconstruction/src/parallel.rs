//! Parallel processing utilities for surface reconstruction
//!
//! The pipeline owns a rayon [`ThreadPool`] built from [`ThreadPoolConfig`];
//! every stage runs inside `ThreadPool::install` so parallel iterators
//! use that pool. Floating point reductions go through
//! [`deterministic_sum`] and [`deterministic_dot`], which split the input
//! into fixed-size chunks and add the partial sums in chunk order, so results
//! do not depend on the thread count or on scheduling.

use densemesh_core::{Error, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

/// Elements per partial sum in deterministic reductions
pub const REDUCTION_CHUNK: usize = 4096;

/// Thread pool configuration for parallel processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Number of threads to use (None = one per logical core)
    pub num_threads: Option<usize>,
    /// Thread stack size in bytes
    pub stack_size: Option<usize>,
    /// Thread name prefix
    pub thread_name_prefix: String,
    /// Enable parallel processing (can be disabled for debugging)
    pub enabled: bool,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            stack_size: Some(8 * 1024 * 1024),
            thread_name_prefix: "densemesh".to_string(),
            enabled: true,
        }
    }
}

impl ThreadPoolConfig {
    /// Set number of threads
    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Set stack size
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Enable or disable parallel processing
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == Some(0) {
            return Err(Error::invalid_parameter(
                "num_threads",
                "must be at least 1 when set",
            ));
        }
        Ok(())
    }

    /// Build the thread pool described by this configuration.
    ///
    /// A disabled configuration yields a single-threaded pool.
    pub fn build_pool(&self) -> Result<ThreadPool> {
        self.validate()?;
        let mut builder = ThreadPoolBuilder::new();

        if !self.enabled {
            builder = builder.num_threads(1);
        } else if let Some(num_threads) = self.num_threads {
            builder = builder.num_threads(num_threads);
        }

        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }

        if !self.thread_name_prefix.is_empty() {
            let prefix = self.thread_name_prefix.clone();
            builder = builder.thread_name(move |index| format!("{}-{}", prefix, index));
        }

        builder
            .build()
            .map_err(|e| Error::Algorithm(format!("Failed to create thread pool: {}", e)))
    }
}

/// Sum of `values`, independent of thread scheduling
pub fn deterministic_sum(values: &[f64]) -> f64 {
    values
        .par_chunks(REDUCTION_CHUNK)
        .map(|chunk| chunk.iter().sum::<f64>())
        .collect::<Vec<f64>>()
        .iter()
        .sum()
}

/// Dot product of two equally long slices, independent of thread scheduling
pub fn deterministic_dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.par_chunks(REDUCTION_CHUNK)
        .zip(b.par_chunks(REDUCTION_CHUNK))
        .map(|(x, y)| x.iter().zip(y).map(|(p, q)| p * q).sum::<f64>())
        .collect::<Vec<f64>>()
        .iter()
        .sum()
}

/// Parallel map preserving input order
pub fn parallel_map<T, U, F>(data: &[T], f: F) -> Vec<U>
where
    T: Sync,
    U: Send,
    F: Fn(&T) -> U + Sync + Send,
{
    data.par_iter().map(f).collect()
}
