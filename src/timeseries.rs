use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Entries kept per metric for charting and statistics
pub const HISTORY_CAPACITY: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point<T> {
    pub time: DateTime<Utc>,
    pub value: T,
}

/// Fixed-capacity, time-ordered buffer. The oldest entry is evicted once full.
#[derive(Debug, Clone)]
pub struct RollingHistory<T> {
    data: VecDeque<Point<T>>,
    capacity: usize,
}

pub trait PointSliceExt<T> {
    fn min_max_time(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)>;
    fn min_max_value(&self) -> Option<(T, T)>;
    fn mean(&self) -> Option<f64>;
}

impl<T> PointSliceExt<T> for [Point<T>]
where
    T: Copy + PartialOrd + Into<f64>,
{
    fn min_max_time(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        // Entries are time-ordered
        Some((self.first()?.time, self.last()?.time))
    }

    fn min_max_value(&self) -> Option<(T, T)> {
        self.iter().fold(None, |acc, point| match acc {
            None => Some((point.value, point.value)),
            Some((min, max)) => Some((
                if point.value < min { point.value } else { min },
                if point.value > max { point.value } else { max },
            )),
        })
    }

    fn mean(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let sum: f64 = self.iter().map(|p| p.value.into()).sum();
        Some(sum / self.len() as f64)
    }
}

impl<T: Copy> RollingHistory<T> {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a value. A timestamp older than the newest entry is clamped to it.
    pub fn push(&mut self, value: T, time: DateTime<Utc>) {
        let time = match self.data.back() {
            Some(last) if time < last.time => {
                log::debug!("Out-of-order sample clamped to {}", last.time);
                last.time
            }
            _ => time,
        };

        self.data.push_back(Point { time, value });
        if self.data.len() > self.capacity {
            self.data.pop_front();
        }
    }

    /// Ordered copy of the retained entries, oldest first
    pub fn snapshot(&self) -> Vec<Point<T>> {
        self.data.iter().copied().collect()
    }

    pub fn values(&self) -> Vec<T> {
        self.data.iter().map(|p| p.value).collect()
    }

    pub fn last_point(&self) -> Option<Point<T>> {
        self.data.back().copied()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl<T: Copy> Default for RollingHistory<T> {
    fn default() -> Self {
        Self::new()
    }
}
