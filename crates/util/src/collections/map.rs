/// Hash map keyed with a fast, DoS-resistant hasher.
pub type Map<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Hash set keyed with a fast, DoS-resistant hasher.
pub type Set<T> = std::collections::HashSet<T, ahash::RandomState>;
