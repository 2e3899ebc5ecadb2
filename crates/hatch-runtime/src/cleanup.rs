use std::fmt;

type Action = Box<dyn FnOnce() + Send>;

/// Release actions registered right after a resource is acquired. They run
/// in reverse order when the value is dropped, on success and error paths
/// alike.
#[derive(Default)]
pub struct Cleanup {
    actions: Vec<Action>,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&mut self, action: impl FnOnce() + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Take over every action registered in `other`.
    pub fn absorb(&mut self, mut other: Cleanup) {
        self.actions.append(&mut other.actions);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Run all actions now.
    pub fn run(self) {
        drop(self);
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanup")
            .field("pending", &self.actions.len())
            .finish()
    }
}
