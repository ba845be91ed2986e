//! Bounded worker-pool / join-all primitive. Task bodies are pure functions
//! of `(key, params)`; the pool runs one task per key and returns an
//! ordered map from key to result, over `rayon::iter::IntoParallelIterator`.

use std::collections::BTreeMap;

use rayon::prelude::*;

/// Run `f` once per `(key, item)` pair across a bounded rayon thread pool,
/// collecting results into an ordered map keyed by the original key. A
/// failing task short-circuits the whole cohort with its error, matching
/// "the caller awaits the whole cohort before proceeding".
pub fn join_all<K, T, R, E, F>(items: Vec<(K, T)>, f: F) -> Result<BTreeMap<K, R>, E>
where
    K: Ord + Send,
    T: Send,
    R: Send,
    E: Send,
    F: Fn(&K, T) -> Result<R, E> + Send + Sync,
{
    items
        .into_par_iter()
        .map(|(key, item)| {
            let result = f(&key, item)?;
            Ok((key, result))
        })
        .collect::<Result<Vec<_>, E>>()
        .map(|pairs| pairs.into_iter().collect())
}

/// Build a rayon thread pool sized to `threads` (or the rayon default of
/// available cores when `None`), for callers that need explicit control
/// over parallelism (`EngineConfig::worker_threads`).
pub fn build_pool(threads: Option<usize>) -> rayon::ThreadPool {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    builder.build().expect("rayon thread pool should build")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_all_preserves_keys_in_order() {
        let items = vec![("b", 2), ("a", 1), ("c", 3)];
        let result: Result<BTreeMap<&str, i32>, ()> =
            join_all(items, |_k, v| Ok::<_, ()>(v * 10));
        let map = result.unwrap();
        assert_eq!(map.get("a"), Some(&10));
        assert_eq!(map.get("b"), Some(&20));
        assert_eq!(map.get("c"), Some(&30));
    }

    #[test]
    fn join_all_propagates_first_error() {
        let items = vec![("a", 1), ("b", 2)];
        let result: Result<BTreeMap<&str, i32>, &'static str> = join_all(items, |k, v| {
            if *k == "b" {
                Err("boom")
            } else {
                Ok(v)
            }
        });
        assert_eq!(result.unwrap_err(), "boom");
    }
}
