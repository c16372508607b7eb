use indexmap::{IndexMap, IndexSet};

pub const MAX_TASK_PRIORITY: usize = 2;

/// Pending tasks of one priority level: globally available tasks plus a
/// per-address index of tasks with local input.
#[derive(Debug, Default)]
pub struct PendingTaskLayer {
    pub global_tasks: IndexSet<usize>,
    pub address_to_local_tasks: IndexMap<String, IndexSet<usize>>,
}

/// Registry of pending and locality hints, layered by priority. Entries
/// are allowed to go stale; the dispatch loop prunes them lazily when a
/// task turns out to have no pending jobs or no locality left.
#[derive(Debug)]
pub struct PendingTaskRegistry {
    layers: Vec<PendingTaskLayer>,
}

impl PendingTaskRegistry {
    pub fn new() -> Self {
        Self {
            layers: (0..=MAX_TASK_PRIORITY)
                .map(|_| PendingTaskLayer::default())
                .collect(),
        }
    }

    pub fn layer(&self, priority: usize) -> &PendingTaskLayer {
        &self.layers[priority]
    }

    pub fn layer_mut(&mut self, priority: usize) -> &mut PendingTaskLayer {
        &mut self.layers[priority]
    }

    pub fn priorities_high_to_low(&self) -> impl Iterator<Item = usize> {
        (0..=MAX_TASK_PRIORITY).rev()
    }

    pub fn add_pending_hint(&mut self, priority: usize, task_index: usize) -> bool {
        self.layers[priority].global_tasks.insert(task_index)
    }

    pub fn add_locality_hint(
        &mut self,
        priority: usize,
        task_index: usize,
        address: &str,
    ) -> bool {
        self.layers[priority]
            .address_to_local_tasks
            .entry(address.to_string())
            .or_default()
            .insert(task_index)
    }

    pub fn remove_pending_hint(&mut self, priority: usize, task_index: usize) {
        self.layers[priority].global_tasks.shift_remove(&task_index);
    }
}

impl Default for PendingTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hints_deduplicate() {
        let mut registry = PendingTaskRegistry::new();
        assert!(registry.add_pending_hint(0, 3));
        assert!(!registry.add_pending_hint(0, 3));

        assert!(registry.add_locality_hint(1, 3, "node-a"));
        assert!(!registry.add_locality_hint(1, 3, "node-a"));
        assert!(registry.add_locality_hint(1, 3, "node-b"));

        registry.remove_pending_hint(0, 3);
        assert!(registry.layer(0).global_tasks.is_empty());
        assert_eq!(
            registry.layer(1).address_to_local_tasks["node-a"].len(),
            1
        );
    }

    #[test]
    fn priorities_iterate_high_to_low() {
        let registry = PendingTaskRegistry::new();
        let order: Vec<usize> = registry.priorities_high_to_low().collect();
        assert_eq!(order, vec![2, 1, 0]);
    }
}
