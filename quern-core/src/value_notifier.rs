use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;
use std::sync::Arc;

type Listener<T> = Box<dyn Fn(&T) + Sync + Send>;

/// Holder of the current snapshot of a value behind an atomic pointer.
///
/// Readers never see a torn value and reads are monotonic within the process:
/// once `store` publishes a snapshot, no subsequent `load` observes an older
/// one. Subsystems that need to react to updates register listeners, usually
/// through [`Computed`].
pub struct ValueNotifier<T> {
  value: ArcSwap<T>,
  listeners: Mutex<Vec<Listener<T>>>,
}

impl<T> ValueNotifier<T> {
  pub fn new(v: T) -> Self {
    return ValueNotifier {
      value: ArcSwap::from_pointee(v),
      listeners: Mutex::new(Vec::new()),
    };
  }

  pub fn load(&self) -> Guard<Arc<T>> {
    return self.value.load();
  }

  pub fn load_full(&self) -> Arc<T> {
    return self.value.load_full();
  }

  pub fn store(&self, v: T) {
    let ptr = Arc::new(v);
    self.value.store(ptr.clone());

    for callback in self.listeners.lock().iter() {
      callback(&ptr);
    }
  }

  pub fn listen<F>(&self, callback: F)
  where
    F: 'static + Sync + Send + Fn(&T),
  {
    self.listeners.lock().push(Box::new(callback));
  }
}

struct ComputedState<T, V> {
  value: ArcSwap<T>,
  f: Box<dyn Sync + Send + Fn(&V) -> T>,
}

/// A value derived from a [`ValueNotifier`], recomputed whenever a new
/// snapshot is published. This is how subsystems sensitive to live config
/// changes (mailer, request filter, token minter) refresh at reload time.
pub struct Computed<T, V> {
  state: Arc<ComputedState<T, V>>,
}

impl<T: 'static + Sync + Send, V: 'static> Computed<T, V> {
  pub fn new(notifier: &ValueNotifier<V>, f: impl 'static + Sync + Send + Fn(&V) -> T) -> Self {
    let state = Arc::new(ComputedState {
      value: ArcSwap::<T>::from_pointee(f(&notifier.load())),
      f: Box::new(f),
    });

    let state_ptr = state.clone();
    notifier.listen(move |v| {
      state_ptr.value.store(Arc::new((*state_ptr.f)(v)));
    });

    return Computed { state };
  }

  pub fn load(&self) -> Guard<Arc<T>> {
    return self.state.value.load();
  }

  pub fn load_full(&self) -> Arc<T> {
    return self.state.value.load_full();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_value_notifier() {
    let v = ValueNotifier::new(42);
    assert_eq!(**v.load(), 42);
    v.store(23);
    assert_eq!(**v.load(), 23);
  }

  #[test]
  fn test_computed_refreshes_on_store() {
    let v = ValueNotifier::new(42);

    let c = Computed::new(&v, |v| v * 2);
    assert_eq!(**c.load(), 2 * 42);

    v.store(23);
    assert_eq!(**c.load(), 2 * 23);
  }
}
