//! Serde support for [`CuckooMap`].

use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CuckooMap;

impl<K, V, S> Serialize for CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + Serialize,
    V: Send + Sync + Serialize,
    S: BuildHasher + Sync,
{
    /// Serializes by locking the table; concurrent operations block for
    /// the duration.
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        let locked = self.lock_table();
        let mut map = serializer.serialize_map(Some(locked.len()))?;
        for (key, value) in locked.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de, K, V, S> Deserialize<'de> for CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + Deserialize<'de>,
    V: Send + Sync + Deserialize<'de>,
    S: BuildHasher + Sync + Default,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(MapVisitor {
            _map: PhantomData,
        })
    }
}

struct MapVisitor<K, V, S> {
    _map: PhantomData<CuckooMap<K, V, S>>,
}

impl<'de, K, V, S> Visitor<'de> for MapVisitor<K, V, S>
where
    K: Hash + Eq + Send + Sync + Deserialize<'de>,
    V: Send + Sync + Deserialize<'de>,
    S: BuildHasher + Sync + Default,
{
    type Value = CuckooMap<K, V, S>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("a map")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let map = CuckooMap::with_capacity_and_hasher(
            access.size_hint().unwrap_or(0),
            S::default(),
        );
        while let Some((key, value)) = access.next_entry()? {
            map.insert_or_assign(key, value)
                .map_err(serde::de::Error::custom)?;
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use crate::CuckooMap;

    #[test]
    fn roundtrip_through_json() {
        let map: CuckooMap<String, u32> = CuckooMap::new();
        map.insert("one".into(), 1).unwrap();
        map.insert("two".into(), 2).unwrap();

        let json = serde_json::to_string(&map).unwrap();
        let back: CuckooMap<String, u32> = serde_json::from_str(&json).unwrap();

        assert_eq!(back.len(), 2);
        assert_eq!(back.get("one"), Some(1));
        assert_eq!(back.get("two"), Some(2));
    }

    #[test]
    fn deserialize_keeps_last_duplicate() {
        let back: CuckooMap<String, u32> = serde_json::from_str(r#"{"a": 1, "a": 2}"#).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back.get("a"), Some(2));
    }
}
