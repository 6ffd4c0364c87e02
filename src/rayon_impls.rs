//! Rayon integration for [`CuckooMap`].
//!
//! A concurrent map collects from a parallel iterator by simply letting
//! every rayon worker insert directly; there is no merge step.

use std::hash::{BuildHasher, Hash};

use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

use crate::CuckooMap;

impl<K, V, S> FromParallelIterator<(K, V)> for CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync + Default,
{
    fn from_par_iter<I>(par_iter: I) -> Self
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        let map = CuckooMap::with_hasher(S::default());
        {
            let mut map_ref = &map;
            map_ref.par_extend(par_iter);
        }
        map
    }
}

impl<K, V, S> ParallelExtend<(K, V)> for CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        (&*self).par_extend(par_iter);
    }
}

impl<K, V, S> ParallelExtend<(K, V)> for &CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        let map: &CuckooMap<K, V, S> = self;
        par_iter.into_par_iter().for_each(|(key, value)| {
            map.insert_or_assign(key, value)
                .expect("parallel extend failed to resize the table");
        });
    }
}
