use crate::tuple::{pack, prefix_range, unpack, TupleItem};
use serde::Serialize;
use slime_lib::{SlimeError, SlimeResult, Stat, MAX_CHUNKS};
use uuid::Uuid;

pub const TAG_FILE: &str = "file";
pub const TAG_LOCATION: &str = "location";
pub const TAG_CONFIG: &str = "config";
pub const TAG_WAL: &str = "wal2";
pub const TAG_WAL_LEGACY: &str = "wal";
pub const TAG_LOCATION_LIST: &str = "locationlist";

const SUB_LOCATION: &str = "location";
const SUB_PREFIX: &str = "prefix";
const RECORD_VERSION: i64 = 0;

pub type PrefixId = [u8; 16];

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub path: String,
    pub size: u64,
    pub sha256: [u8; 32],
    pub write_time: i64,
    pub prefix_id: PrefixId,
    pub data_chunks: u16,
    pub mapping_value: u32,
    /// `locations[i]` holds chunk `i`.
    pub locations: Vec<Uuid>,
}

impl File {
    pub fn stat(&self) -> Stat {
        Stat {
            sha256: self.sha256,
            size: self.size,
            write_time: self.write_time,
        }
    }

    pub fn local_key(&self, index: usize) -> String {
        local_key(&self.prefix_id, &self.sha256, index)
    }

    /// Whether this file places chunk `key` on `location`.
    pub fn should_have(&self, location: &Uuid, key: &str) -> bool {
        self.locations
            .iter()
            .enumerate()
            .any(|(i, l)| l == location && self.local_key(i) == key)
    }

    fn key(&self) -> Vec<u8> {
        file_key(&self.path)
    }

    fn value(&self) -> Vec<u8> {
        let mut items = vec![
            TupleItem::Int(RECORD_VERSION),
            TupleItem::Int(self.size as i64),
            TupleItem::bytes(&self.sha256),
            TupleItem::Int(self.write_time),
            TupleItem::bytes(&self.prefix_id),
            TupleItem::Int(self.data_chunks as i64),
            TupleItem::Int(self.mapping_value as i64),
        ];
        items.extend(self.locations.iter().map(|l| TupleItem::bytes(l.as_bytes())));
        pack(&items)
    }

    fn decode(path: &str, value: &[u8]) -> SlimeResult<Self> {
        let items = unpack(value)?;
        if items.len() < 7 {
            return Err(SlimeError::BadFormat(format!(
                "file {}: {} fields",
                path,
                items.len()
            )));
        }
        check_version(&items[0], "file", path)?;
        let size = u64::try_from(items[1].as_int()?)
            .map_err(|_| SlimeError::BadFormat(format!("file {}: negative size", path)))?;
        let data_chunks = u16::try_from(items[5].as_int()?)
            .map_err(|_| SlimeError::BadFormat(format!("file {}: bad data chunks", path)))?;
        let mapping_value = u32::try_from(items[6].as_int()?)
            .map_err(|_| SlimeError::BadFormat(format!("file {}: bad mapping value", path)))?;
        let locations = items[7..]
            .iter()
            .map(|i| uuid_from(i.as_bytes()?))
            .collect::<SlimeResult<Vec<_>>>()?;

        if data_chunks == 0 || (data_chunks as usize) > locations.len() || locations.len() > MAX_CHUNKS {
            return Err(SlimeError::BadFormat(format!(
                "file {}: {} data chunks over {} locations",
                path,
                data_chunks,
                locations.len()
            )));
        }

        Ok(Self {
            path: path.to_string(),
            size,
            sha256: fixed(items[2].as_bytes()?, "sha256")?,
            write_time: items[3].as_int()?,
            prefix_id: fixed(items[4].as_bytes()?, "prefix id")?,
            data_chunks,
            mapping_value,
            locations,
        })
    }

    /// Index pairs implied by this record.
    fn index_pairs(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::with_capacity(self.locations.len() * 2 + 1);
        for (i, loc) in self.locations.iter().enumerate() {
            out.push((file_location_key(loc, &self.path), Vec::new()));
            out.push((location_list_key(loc, &self.local_key(i)), Vec::new()));
        }
        out.push((prefix_key(&self.prefix_id), self.path.as_bytes().to_vec()));
        out
    }
}

/// One discovered chunk store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub uuid: Uuid,
    pub url: String,
    pub name: String,
    pub dead: bool,
    pub last_seen: i64,
    pub alloc_split: Vec<String>,
}

impl Location {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            url: String::new(),
            name: String::new(),
            dead: false,
            last_seen: 0,
            alloc_split: Vec::new(),
        }
    }

    fn value(&self) -> Vec<u8> {
        let mut items = vec![
            TupleItem::Int(RECORD_VERSION),
            TupleItem::str(&self.url),
            TupleItem::str(&self.name),
            TupleItem::Bool(self.dead),
            TupleItem::Int(self.last_seen),
        ];
        items.extend(self.alloc_split.iter().map(|s| TupleItem::str(s)));
        pack(&items)
    }

    fn decode(uuid: Uuid, value: &[u8]) -> SlimeResult<Self> {
        let items = unpack(value)?;
        if items.len() < 5 {
            return Err(SlimeError::BadFormat(format!(
                "location {}: {} fields",
                uuid,
                items.len()
            )));
        }
        check_version(&items[0], "location", &uuid.to_string())?;
        Ok(Self {
            uuid,
            url: items[1].as_str()?.to_string(),
            name: items[2].as_str()?.to_string(),
            dead: items[3].as_bool()?,
            last_seen: items[4].as_int()?,
            alloc_split: items[5..]
                .iter()
                .map(|i| i.as_str().map(str::to_string))
                .collect::<SlimeResult<Vec<_>>>()?,
        })
    }
}

fn check_version(item: &TupleItem, what: &str, id: &str) -> SlimeResult<()> {
    let v = item.as_int()?;
    if v != RECORD_VERSION {
        return Err(SlimeError::BadFormat(format!(
            "{} {}: unknown version {}",
            what, id, v
        )));
    }
    Ok(())
}

fn fixed<const N: usize>(b: &[u8], what: &str) -> SlimeResult<[u8; N]> {
    b.try_into()
        .map_err(|_| SlimeError::BadFormat(format!("{} has {} bytes", what, b.len())))
}

pub(crate) fn uuid_from(b: &[u8]) -> SlimeResult<Uuid> {
    Uuid::from_slice(b).map_err(|e| SlimeError::BadFormat(format!("bad uuid: {}", e)))
}

pub fn new_prefix_id() -> PrefixId {
    rand::random()
}

/// Name of chunk `index` of a write on its store.
pub fn local_key(prefix_id: &PrefixId, sha256: &[u8; 32], index: usize) -> String {
    format!(
        "{}_{}_{}",
        hex::encode(prefix_id),
        hex::encode(&sha256[..8]),
        index
    )
}

/// Split a chunk name into prefix id and chunk index.
pub fn parse_local_key(key: &str) -> SlimeResult<(PrefixId, usize)> {
    let bad = || SlimeError::BadFormat(format!("bad chunk name {:?}", key));
    let mut parts = key.split('_');
    let (prefix, _sha, index) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(p), Some(s), Some(i), None) => (p, s, i),
        _ => return Err(bad()),
    };
    let mut prefix_id = [0u8; 16];
    hex::decode_to_slice(prefix, &mut prefix_id).map_err(|_| bad())?;
    let index = index.parse::<usize>().map_err(|_| bad())?;
    Ok((prefix_id, index))
}

pub(crate) fn file_key(path: &str) -> Vec<u8> {
    pack(&[TupleItem::str(TAG_FILE), TupleItem::bytes(path.as_bytes())])
}

/// Key range holding every file record, and nothing else.
pub(crate) fn file_range() -> (Vec<u8>, Vec<u8>) {
    let base = pack(&[TupleItem::str(TAG_FILE)]);
    let mut low = base.clone();
    low.push(0x01);
    let mut high = base;
    high.push(0x02);
    (low, high)
}

pub(crate) fn path_from_file_key(key: &[u8]) -> SlimeResult<String> {
    let items = unpack(key)?;
    match items.as_slice() {
        [TupleItem::Str(tag), TupleItem::Bytes(path)] if tag == TAG_FILE => String::from_utf8(path.clone())
            .map_err(|e| SlimeError::BadFormat(format!("file path not utf8: {}", e))),
        _ => Err(SlimeError::BadFormat(format!("not a file key: {:?}", items))),
    }
}

pub(crate) fn file_location_prefix(location: &Uuid) -> Vec<u8> {
    pack(&[
        TupleItem::str(TAG_FILE),
        TupleItem::str(SUB_LOCATION),
        TupleItem::bytes(location.as_bytes()),
    ])
}

pub(crate) fn file_location_key(location: &Uuid, path: &str) -> Vec<u8> {
    let mut k = file_location_prefix(location);
    k.extend(pack(&[TupleItem::bytes(path.as_bytes())]));
    k
}

/// `(location, path)` of a file-by-location index key.
pub(crate) fn parse_file_location_key(key: &[u8]) -> SlimeResult<(Uuid, String)> {
    let items = unpack(key)?;
    match items.as_slice() {
        [TupleItem::Str(tag), TupleItem::Str(sub), TupleItem::Bytes(loc), TupleItem::Bytes(path)]
            if tag == TAG_FILE && sub == SUB_LOCATION =>
        {
            let path = String::from_utf8(path.clone())
                .map_err(|e| SlimeError::BadFormat(format!("file path not utf8: {}", e)))?;
            Ok((uuid_from(loc)?, path))
        }
        _ => Err(SlimeError::BadFormat(format!("not a file location key: {:?}", items))),
    }
}

/// `(location, local key)` of a location-contents index key.
pub(crate) fn parse_location_list_key(key: &[u8]) -> SlimeResult<(Uuid, String)> {
    let items = unpack(key)?;
    match items.as_slice() {
        [TupleItem::Str(tag), TupleItem::Bytes(loc), TupleItem::Str(local)]
            if tag == TAG_LOCATION_LIST =>
        {
            Ok((uuid_from(loc)?, local.clone()))
        }
        _ => Err(SlimeError::BadFormat(format!("not a location list key: {:?}", items))),
    }
}

pub(crate) fn file_location_range() -> (Vec<u8>, Vec<u8>) {
    prefix_range(&pack(&[TupleItem::str(TAG_FILE), TupleItem::str(SUB_LOCATION)]))
}

pub(crate) fn prefix_index_range() -> (Vec<u8>, Vec<u8>) {
    prefix_range(&pack(&[TupleItem::str(TAG_FILE), TupleItem::str(SUB_PREFIX)]))
}

pub(crate) fn location_list_range() -> (Vec<u8>, Vec<u8>) {
    prefix_range(&pack(&[TupleItem::str(TAG_LOCATION_LIST)]))
}

pub(crate) fn location_list_prefix(location: &Uuid) -> Vec<u8> {
    pack(&[
        TupleItem::str(TAG_LOCATION_LIST),
        TupleItem::bytes(location.as_bytes()),
    ])
}

pub(crate) fn location_list_key(location: &Uuid, local_key: &str) -> Vec<u8> {
    let mut k = location_list_prefix(location);
    k.extend(pack(&[TupleItem::str(local_key)]));
    k
}

pub(crate) fn prefix_key(prefix_id: &PrefixId) -> Vec<u8> {
    pack(&[
        TupleItem::str(TAG_FILE),
        TupleItem::str(SUB_PREFIX),
        TupleItem::bytes(prefix_id),
    ])
}

pub(crate) fn location_key(uuid: &Uuid) -> Vec<u8> {
    pack(&[TupleItem::str(TAG_LOCATION), TupleItem::bytes(uuid.as_bytes())])
}

pub(crate) fn location_tag_prefix() -> Vec<u8> {
    pack(&[TupleItem::str(TAG_LOCATION)])
}

pub(crate) fn config_key(name: &str) -> Vec<u8> {
    pack(&[TupleItem::str(TAG_CONFIG), TupleItem::str(name)])
}

pub(crate) fn wal_key(prefix_id: &PrefixId) -> Vec<u8> {
    pack(&[TupleItem::str(TAG_WAL), TupleItem::bytes(prefix_id)])
}

pub(crate) fn wal_legacy_key(prefix_id: &PrefixId) -> Vec<u8> {
    pack(&[TupleItem::str(TAG_WAL_LEGACY), TupleItem::bytes(prefix_id)])
}

pub(crate) fn wal_tag_prefix() -> Vec<u8> {
    pack(&[TupleItem::str(TAG_WAL)])
}

/// Last element of a packed key, as bytes or string payload.
pub(crate) fn last_element(key: &[u8]) -> SlimeResult<TupleItem> {
    unpack(key)?
        .pop()
        .ok_or_else(|| SlimeError::BadFormat("empty key".to_string()))
}

pub(crate) fn encode_file(file: &File) -> (Vec<u8>, Vec<u8>) {
    (file.key(), file.value())
}

pub(crate) fn decode_file(key: &[u8], value: &[u8]) -> SlimeResult<File> {
    let path = path_from_file_key(key)?;
    File::decode(&path, value)
}

pub(crate) fn file_index_pairs(file: &File) -> Vec<(Vec<u8>, Vec<u8>)> {
    file.index_pairs()
}

pub(crate) fn encode_location(loc: &Location) -> (Vec<u8>, Vec<u8>) {
    (location_key(&loc.uuid), loc.value())
}

pub(crate) fn decode_location(key: &[u8], value: &[u8]) -> SlimeResult<Location> {
    let uuid = uuid_from(last_element(key)?.as_bytes()?)?;
    Location::decode(uuid, value)
}

pub(crate) fn encode_wal(stamps: &[i64]) -> Vec<u8> {
    let items: Vec<TupleItem> = stamps.iter().map(|t| TupleItem::Int(*t)).collect();
    pack(&items)
}

pub(crate) fn decode_wal(value: &[u8]) -> SlimeResult<Vec<i64>> {
    unpack(value)?.iter().map(TupleItem::as_int).collect()
}
