// Progress aggregation: many weighted operations folded into one 0..1 value.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

struct Op {
    weight: f32,
    value: f32,
}

struct Batch {
    next_id: u64,
    ops: HashMap<u64, Op>,
}

impl Batch {
    fn overall(&self) -> f32 {
        let total: f32 = self.ops.values().map(|op| op.weight).sum();
        if total <= 0.0 {
            return 1.0;
        }
        let done: f32 = self.ops.values().map(|op| op.weight * op.value).sum();
        (done / total).clamp(0.0, 1.0)
    }

    fn all_finished(&self) -> bool {
        self.ops.values().all(|op| op.value >= 1.0)
    }
}

struct Inner {
    batch: Mutex<Batch>,
    tx: watch::Sender<f32>,
}

impl Inner {
    fn update(&self, id: u64, value: f32) {
        let overall = {
            let mut batch = self.batch.lock();
            if let Some(op) = batch.ops.get_mut(&id) {
                op.value = op.value.max(value.clamp(0.0, 1.0));
            }
            batch.overall()
        };
        self.tx.send_replace(overall);
    }
}

/// Combines the progress of every operation started since the last time all
/// operations were finished. Idle value is 1.0.
#[derive(Clone)]
pub struct ProgressAggregator {
    inner: Arc<Inner>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(1.0);
        Self {
            inner: Arc::new(Inner {
                batch: Mutex::new(Batch {
                    next_id: 0,
                    ops: HashMap::new(),
                }),
                tx,
            }),
        }
    }

    /// Start tracking an operation with the given relative weight.
    pub fn begin(&self, weight: f32) -> ProgressHandle {
        let (id, overall) = {
            let mut batch = self.inner.batch.lock();
            if batch.all_finished() {
                batch.ops.clear();
            }
            let id = batch.next_id;
            batch.next_id += 1;
            batch.ops.insert(
                id,
                Op {
                    weight: weight.max(f32::EPSILON),
                    value: 0.0,
                },
            );
            (id, batch.overall())
        };
        self.inner.tx.send_replace(overall);
        ProgressHandle {
            target: Target::Op {
                inner: Arc::clone(&self.inner),
                id,
            },
            last: Mutex::new(0.0),
        }
    }

    /// Current aggregate value.
    pub fn value(&self) -> f32 {
        *self.inner.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<f32> {
        self.inner.tx.subscribe()
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new()
    }
}

struct Split {
    parent: ProgressHandle,
    values: Mutex<Vec<f32>>,
}

enum Target {
    Detached,
    Op { inner: Arc<Inner>, id: u64 },
    Callback(Arc<dyn Fn(f32) + Send + Sync>),
    Child { split: Arc<Split>, index: usize },
}

/// Progress of one operation. Reported values are clamped to [0, 1] and
/// never go backwards.
pub struct ProgressHandle {
    target: Target,
    last: Mutex<f32>,
}

impl ProgressHandle {
    /// A handle nobody observes.
    pub fn detached() -> Self {
        Self {
            target: Target::Detached,
            last: Mutex::new(0.0),
        }
    }

    pub fn with_callback(callback: impl Fn(f32) + Send + Sync + 'static) -> Self {
        Self {
            target: Target::Callback(Arc::new(callback)),
            last: Mutex::new(0.0),
        }
    }

    pub fn report(&self, value: f32) {
        let value = {
            let mut last = self.last.lock();
            let value = value.clamp(0.0, 1.0);
            if value <= *last {
                return;
            }
            *last = value;
            value
        };

        match &self.target {
            Target::Detached => {}
            Target::Op { inner, id } => inner.update(*id, value),
            Target::Callback(callback) => callback(value),
            Target::Child { split, index } => {
                let mean = {
                    let mut values = split.values.lock();
                    values[*index] = value;
                    values.iter().sum::<f32>() / values.len() as f32
                };
                split.parent.report(mean);
            }
        }
    }

    pub fn finish(&self) {
        self.report(1.0);
    }

    pub fn value(&self) -> f32 {
        *self.last.lock()
    }

    /// Divide this handle into `parts` equally weighted children; the
    /// parent follows the mean of the children.
    pub fn split(self, parts: usize) -> Vec<ProgressHandle> {
        let parts = parts.max(1);
        let split = Arc::new(Split {
            parent: self,
            values: Mutex::new(vec![0.0; parts]),
        });
        (0..parts)
            .map(|index| ProgressHandle {
                target: Target::Child {
                    split: Arc::clone(&split),
                    index,
                },
                last: Mutex::new(0.0),
            })
            .collect()
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        // An abandoned operation must not hold the aggregate below 1.0.
        if let Target::Op { inner, id } = &self.target {
            inner.update(*id, 1.0);
        }
    }
}
