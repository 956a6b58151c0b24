use std::{
	collections::{hash_map::Entry, HashMap},
	fmt,
	hash::Hash,
};

/// Returned by [`Registry::register`] when the key is taken, handing the rejected value back
/// to the caller, who stays responsible for releasing it.
pub struct AlreadyRegistered<V>(pub V);

impl<V> fmt::Debug for AlreadyRegistered<V> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("AlreadyRegistered")
	}
}

/// Owns values keyed by caller chosen handles.
///
/// Registering moves the value in, unregistering moves it back out to the remover.
pub struct Registry<K, V> {
	entries: HashMap<K, V>,
}

impl<K: Eq + Hash, V> Registry<K, V> {
	pub fn new() -> Self {
		Self {
			entries: HashMap::new(),
		}
	}

	pub fn register(&mut self, key: K, value: V) -> Result<(), AlreadyRegistered<V>> {
		match self.entries.entry(key) {
			Entry::Occupied(_) => Err(AlreadyRegistered(value)),
			Entry::Vacant(entry) => {
				entry.insert(value);
				Ok(())
			}
		}
	}

	pub fn get_or_insert_with(&mut self, key: K, value: impl FnOnce() -> V) -> &V {
		self.entries.entry(key).or_insert_with(value)
	}

	pub fn lookup(&self, key: &K) -> Option<&V> {
		self.entries.get(key)
	}

	pub fn contains(&self, key: &K) -> bool {
		self.entries.contains_key(key)
	}

	pub fn unregister(&mut self, key: &K) -> Option<V> {
		self.entries.remove(key)
	}

	pub fn keys(&self) -> impl Iterator<Item = &K> {
		self.entries.keys()
	}
}

impl<K: Eq + Hash, V> Default for Registry<K, V> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K: fmt::Debug, V> fmt::Debug for Registry<K, V> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_set().entries(self.entries.keys()).finish()
	}
}
