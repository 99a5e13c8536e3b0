/// Consistent-hash ring mapping routing keys to backends
///
/// Points are placed ketama style: each backend contributes `replicas` md5
/// digests of `"{addr}-{j}"`, and each digest yields three 32-bit points.
/// Routing keys are hashed from their decimal string form, so selection is
/// stable across processes and rebuilds for an unchanged backend set.
use crate::core::Backend;
use std::cmp::Ordering;

/// Default number of digests per backend
pub const DEFAULT_REPLICAS: usize = 40;

/// Points derived from one md5 digest
const POINTS_PER_DIGEST: usize = 3;

#[derive(Debug, Clone, Copy)]
struct RingPoint {
    hash: u32,
    backend: usize,
}

/// Immutable consistent-hash ring. Safe to share across sessions without locking.
#[derive(Debug, Clone)]
pub struct BackendRing {
    backends: Vec<Backend>,
    points: Vec<RingPoint>,
    replicas: usize,
}

impl BackendRing {
    pub fn new<I>(backends: I) -> Self
    where
        I: IntoIterator<Item = Backend>,
    {
        Self::with_replicas(backends, DEFAULT_REPLICAS)
    }

    pub fn with_replicas<I>(backends: I, replicas: usize) -> Self
    where
        I: IntoIterator<Item = Backend>,
    {
        let mut unique: Vec<Backend> = Vec::new();
        for backend in backends {
            if !unique.contains(&backend) {
                unique.push(backend);
            }
        }

        let mut points = Vec::with_capacity(unique.len() * replicas * POINTS_PER_DIGEST);
        for (index, backend) in unique.iter().enumerate() {
            for replica in 0..replicas {
                let digest = md5::compute(format!("{}-{}", backend.addr(), replica));
                for chunk in digest.0.chunks_exact(4).take(POINTS_PER_DIGEST) {
                    points.push(RingPoint {
                        hash: u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                        backend: index,
                    });
                }
            }
        }

        // Ties are broken by address, not insertion order, so rebuilt rings agree
        points.sort_by(|a, b| match a.hash.cmp(&b.hash) {
            Ordering::Equal => unique[a.backend].cmp(&unique[b.backend]),
            other => other,
        });

        Self {
            backends: unique,
            points,
            replicas,
        }
    }

    /// Select the backend owning `routing_key`; `None` only for an empty ring
    pub fn select(&self, routing_key: u32) -> Option<&Backend> {
        if self.points.is_empty() {
            return None;
        }

        let hash = key_hash(routing_key);
        let position = self.points.partition_point(|point| point.hash < hash);
        let point = self.points.get(position).unwrap_or(&self.points[0]);
        Some(&self.backends[point.backend])
    }

    /// A new ring with `addr` removed
    pub fn without(&self, addr: &str) -> Self {
        Self::with_replicas(
            self.backends.iter().filter(|b| b.addr() != addr).cloned(),
            self.replicas,
        )
    }

    /// A new ring with `backend` added
    pub fn with(&self, backend: Backend) -> Self {
        Self::with_replicas(
            self.backends.iter().cloned().chain(std::iter::once(backend)),
            self.replicas,
        )
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }
}

fn key_hash(routing_key: u32) -> u32 {
    let digest = md5::compute(routing_key.to_string());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
