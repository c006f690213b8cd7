use candle_core::Tensor;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{PviError, Result};

/// One party's private data, inputs `x` (n x d) and labels `y` (n)
#[derive(Debug, Clone)]
pub struct Shard {
    pub x: Tensor,
    pub y: Tensor,
}

impl Shard {
    pub fn new(x: Tensor, y: Tensor) -> Result<Self> {
        let n = x.dim(0)?;
        if y.dims() != [n] {
            return Err(PviError::IncompatibleShape {
                left: x.dims().to_vec(),
                right: y.dims().to_vec(),
            });
        }
        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.y.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take rows in the given order
    pub fn select(&self, rows: &[u32]) -> Result<Shard> {
        let idx = Tensor::from_slice(rows, rows.len(), self.x.device())?;
        Ok(Shard {
            x: self.x.index_select(&idx, 0)?,
            y: self.y.index_select(&idx, 0)?,
        })
    }

    /// Shuffle rows and chop them into minibatches of at most `batch_size`
    pub fn minibatches<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Result<Vec<Shard>> {
        if self.is_empty() {
            return Err(PviError::EmptyShard);
        }
        let mut rows: Vec<u32> = (0..self.len() as u32).collect();
        rows.shuffle(rng);
        rows.chunks(batch_size.max(1))
            .map(|chunk| self.select(chunk))
            .collect()
    }

    /// Stack shards row-wise
    pub fn concat(shards: &[&Shard]) -> Result<Shard> {
        if shards.is_empty() {
            return Err(PviError::EmptyShard);
        }
        let xs: Vec<&Tensor> = shards.iter().map(|s| &s.x).collect();
        let ys: Vec<&Tensor> = shards.iter().map(|s| &s.y).collect();
        Ok(Shard {
            x: Tensor::cat(&xs, 0)?,
            y: Tensor::cat(&ys, 0)?,
        })
    }

    /// Homogeneous random partition into `num_shards` nearly equal parts
    pub fn split<R: Rng>(&self, num_shards: usize, rng: &mut R) -> Result<Vec<Shard>> {
        if num_shards == 0 || num_shards > self.len() {
            return Err(PviError::InvalidConfig(format!(
                "cannot split {} rows into {} shards",
                self.len(),
                num_shards
            )));
        }
        let mut rows: Vec<u32> = (0..self.len() as u32).collect();
        rows.shuffle(rng);
        let base = self.len() / num_shards;
        let extra = self.len() % num_shards;
        let mut out = Vec::with_capacity(num_shards);
        let mut lb = 0;
        for s in 0..num_shards {
            let ub = lb + base + usize::from(s < extra);
            out.push(self.select(&rows[lb..ub])?);
            lb = ub;
        }
        Ok(out)
    }
}
