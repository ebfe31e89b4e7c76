use std::sync::Mutex;

#[derive(Debug, Default)]
pub(crate) struct MutexCell<T>(Mutex<T>);

impl<'a, T> MutexCell<T> {
    pub fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    pub fn with_inner<F: FnOnce(&mut T) -> O, O>(&'a self, func: F) -> O {
        // a panic while holding the lock leaves the generator state usable
        let mut cell = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        func(&mut *cell)
    }
}

impl<T: Clone> Clone for MutexCell<T> {
    fn clone(&self) -> Self {
        Self::new(self.with_inner(|x| x.clone()))
    }
}
