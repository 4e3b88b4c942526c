//! Input line providers for multi-run jobs

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, RunnerError};

/// Lazily produced input lines
pub type LineIter = Box<dyn Iterator<Item = String> + Send>;

pub trait DataPool: Send + Sync {
    /// Number of lines `lines` yields
    fn size(&self) -> u64;

    /// Fresh pass over the lines, from the first one
    fn lines(&self) -> Result<LineIter>;
}

/// Lines held in memory
pub struct MemoryDataPool {
    lines: Arc<[String]>,
}

impl MemoryDataPool {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

impl DataPool for MemoryDataPool {
    fn size(&self) -> u64 {
        self.lines.len() as u64
    }

    fn lines(&self) -> Result<LineIter> {
        let lines = self.lines.clone();
        Ok(Box::new((0..lines.len()).map(move |i| lines[i].clone())))
    }
}

/// Text file read line by line during the run
pub struct FileDataPool {
    path: PathBuf,
    size: u64,
}

impl FileDataPool {
    /// Open `path`, counting its lines once
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = BufReader::new(File::open(&path)?);
        let mut size = 0;
        for line in reader.lines() {
            line?;
            size += 1;
        }
        Ok(Self { path, size })
    }
}

impl DataPool for FileDataPool {
    fn size(&self) -> u64 {
        self.size
    }

    fn lines(&self) -> Result<LineIter> {
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(Box::new(reader.lines().map_while(|line| line.ok())))
    }
}

/// Arithmetic sequence of numbers rendered as lines
pub struct RangeDataPool {
    start: i64,
    amount: u64,
    step: i64,
    pad: bool,
}

impl RangeDataPool {
    pub fn new(start: i64, amount: u64, step: i64) -> Result<Self> {
        if step == 0 {
            return Err(RunnerError::InvalidArgument("range step must not be zero".into()));
        }
        Ok(Self {
            start,
            amount,
            step,
            pad: false,
        })
    }

    /// Left-pad numbers with zeros to the width of the widest one
    pub fn padded(mut self) -> Self {
        self.pad = true;
        self
    }
}

impl DataPool for RangeDataPool {
    fn size(&self) -> u64 {
        self.amount
    }

    fn lines(&self) -> Result<LineIter> {
        let (start, step) = (self.start, self.step);
        let last = start.saturating_add(step.saturating_mul(self.amount.saturating_sub(1) as i64));
        let width = if self.pad {
            start.to_string().len().max(last.to_string().len())
        } else {
            0
        };

        Ok(Box::new((0..self.amount).map(move |i| {
            let value = start.saturating_add(step.saturating_mul(i as i64));
            format!("{:0width$}", value, width = width)
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pool_restarts() {
        let pool = MemoryDataPool::new(["a:1", "b:2"]);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.lines().unwrap().collect::<Vec<_>>(), vec!["a:1", "b:2"]);
        assert_eq!(pool.lines().unwrap().count(), 2);
    }

    #[test]
    fn test_file_pool_counts_and_streams() {
        let path = std::env::temp_dir().join(format!("rota-runner-data-{}.txt", uuid::Uuid::new_v4()));
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();

        let pool = FileDataPool::open(&path).unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.lines().unwrap().collect::<Vec<_>>(), vec!["one", "two", "three"]);

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(pool.lines(), Err(RunnerError::Io(_))));
    }

    #[test]
    fn test_range_pool() {
        let pool = RangeDataPool::new(8, 3, 1).unwrap().padded();
        assert_eq!(pool.lines().unwrap().collect::<Vec<_>>(), vec!["08", "09", "10"]);

        let down = RangeDataPool::new(10, 3, -5).unwrap();
        assert_eq!(down.lines().unwrap().collect::<Vec<_>>(), vec!["10", "5", "0"]);

        assert!(RangeDataPool::new(0, 10, 0).is_err());
    }
}
