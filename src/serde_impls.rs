use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::fmt::{self, Formatter};
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

use crate::ReferenceMap;

struct MapVisitor<K, V, S> {
    _marker: PhantomData<ReferenceMap<K, V, S>>,
}

impl<K, V, S> Serialize for ReferenceMap<K, V, S>
where
    K: Serialize,
    V: Serialize,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        let guard = self.guard();
        let mut map = serializer.serialize_map(None)?;
        for (key, value) in self.iter(&guard) {
            map.serialize_entry(key, &*value)?;
        }
        map.end()
    }
}

impl<'de, K, V, S> Deserialize<'de> for ReferenceMap<K, V, S>
where
    K: Deserialize<'de> + Hash + Eq,
    V: Deserialize<'de>,
    S: Default + BuildHasher,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(MapVisitor::new())
    }
}

impl<K, V, S> MapVisitor<K, V, S> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<'de, K, V, S> Visitor<'de> for MapVisitor<K, V, S>
where
    K: Deserialize<'de> + Hash + Eq,
    V: Deserialize<'de>,
    S: Default + BuildHasher,
{
    type Value = ReferenceMap<K, V, S>;

    fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "a map")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let values = match access.size_hint() {
            Some(size) => ReferenceMap::with_capacity_and_hasher(size, S::default()),
            None => ReferenceMap::default(),
        };

        while let Some((key, value)) = access.next_entry()? {
            values.insert(key, value);
        }

        Ok(values)
    }
}

#[cfg(test)]
mod test {
    use crate::{MemoryPressure, ReferenceMap, ReferenceType};

    #[test]
    fn test_map() {
        let map: ReferenceMap<u8, u8> = ReferenceMap::new();

        map.insert(0, 4);
        map.insert(1, 3);
        map.insert(2, 2);
        map.insert(3, 1);
        map.insert(4, 0);

        let serialized = serde_json::to_string(&map).unwrap();
        let deserialized: ReferenceMap<u8, u8> = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.len(), 5);
        for i in 0..5 {
            assert_eq!(deserialized.get(&i).as_deref(), Some(&(4 - i)));
        }
    }

    #[test]
    fn reclaimed_entries_are_skipped() {
        let map: ReferenceMap<u8, u8> = ReferenceMap::builder()
            .reference_type(ReferenceType::Weak)
            .build();

        map.insert(0, 0);
        let held = map.get(&0);
        map.insert(1, 1);
        map.reclaim(MemoryPressure::Low);

        let serialized = serde_json::to_string(&map).unwrap();
        assert_eq!(serialized, r#"{"0":0}"#);
        drop(held);
    }
}
