//! Runtime metadata (V14 and V15) as served by `state_getMetadata`
//!
//! Only the portable type registry and the pallet list are decoded; that is
//! enough to name calls and to walk any event the runtime can emit.

use super::{decode_phase, skip_bytes, EventRecord};
use super::registry::CallEntry;
use crate::error::{WatcherError, WatcherResult};

use alloy_primitives::B256;
use parity_scale_codec::{Compact, Decode, Encode};
use std::collections::HashMap;

/// `b"meta"` read as a little endian u32
pub const METADATA_MAGIC: u32 = 0x6174_656d;
const MAX_TYPE_DEPTH: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct PortableType {
    #[codec(compact)]
    id: u32,
    ty: TypeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct TypeInfo {
    path: Vec<String>,
    params: Vec<TypeParam>,
    def: TypeDef,
    docs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct TypeParam {
    name: String,
    ty: Option<Compact<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct Field {
    name: Option<String>,
    ty: Compact<u32>,
    type_name: Option<String>,
    docs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct Variant {
    name: String,
    fields: Vec<Field>,
    index: u8,
    docs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum Primitive {
    Bool,
    Char,
    Str,
    U8,
    U16,
    U32,
    U64,
    U128,
    U256,
    I8,
    I16,
    I32,
    I64,
    I128,
    I256,
}

impl Primitive {
    /// Encoded size, `None` for length prefixed strings
    fn size(self) -> Option<usize> {
        match self {
            Primitive::Bool | Primitive::U8 | Primitive::I8 => Some(1),
            Primitive::U16 | Primitive::I16 => Some(2),
            Primitive::Char | Primitive::U32 | Primitive::I32 => Some(4),
            Primitive::U64 | Primitive::I64 => Some(8),
            Primitive::U128 | Primitive::I128 => Some(16),
            Primitive::U256 | Primitive::I256 => Some(32),
            Primitive::Str => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
enum TypeDef {
    Composite(Vec<Field>),
    Variant(Vec<Variant>),
    Sequence(Compact<u32>),
    Array(u32, Compact<u32>),
    Tuple(Vec<Compact<u32>>),
    Primitive(Primitive),
    Compact(Compact<u32>),
    BitSequence(Compact<u32>, Compact<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
enum StorageEntryType {
    Plain(Compact<u32>),
    Map {
        hashers: Vec<u8>,
        key: Compact<u32>,
        value: Compact<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct StorageEntry {
    name: String,
    modifier: u8,
    ty: StorageEntryType,
    default: Vec<u8>,
    docs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct PalletStorage {
    prefix: String,
    entries: Vec<StorageEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct PalletConstant {
    name: String,
    ty: Compact<u32>,
    value: Vec<u8>,
    docs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct PalletV14 {
    name: String,
    storage: Option<PalletStorage>,
    calls: Option<Compact<u32>>,
    event: Option<Compact<u32>>,
    constants: Vec<PalletConstant>,
    error: Option<Compact<u32>>,
    index: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct PalletV15 {
    base: PalletV14,
    docs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pallet {
    name: String,
    index: u8,
    calls: Option<u32>,
    event: Option<u32>,
}

impl From<PalletV14> for Pallet {
    fn from(pallet: PalletV14) -> Self {
        Self {
            name: pallet.name,
            index: pallet.index,
            calls: pallet.calls.map(|c| c.0),
            event: pallet.event.map(|e| e.0),
        }
    }
}

/// Call and event layouts of one runtime version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeMetadata {
    pub spec_version: u32,
    types: HashMap<u32, TypeInfo>,
    pallets: Vec<Pallet>,
}

impl RuntimeMetadata {
    /// Decode the bytes returned by `state_getMetadata`
    pub fn decode(bytes: &[u8], spec_version: u32) -> WatcherResult<Self> {
        let input = &mut &bytes[..];
        let magic = u32::decode(input)?;
        if magic != METADATA_MAGIC {
            return Err(WatcherError::Decode(format!(
                "not runtime metadata (magic {:#x})",
                magic
            )));
        }

        let version = u8::decode(input)?;
        let types = <Vec<PortableType>>::decode(input)?
            .into_iter()
            .map(|t| (t.id, t.ty))
            .collect();
        let pallets = match version {
            14 => <Vec<PalletV14>>::decode(input)?
                .into_iter()
                .map(Pallet::from)
                .collect(),
            15 => <Vec<PalletV15>>::decode(input)?
                .into_iter()
                .map(|p| Pallet::from(p.base))
                .collect(),
            other => {
                return Err(WatcherError::Decode(format!(
                    "unsupported metadata version V{}",
                    other
                )))
            }
        };

        Ok(Self {
            spec_version,
            types,
            pallets,
        })
    }

    fn pallet(&self, index: u8) -> Option<&Pallet> {
        self.pallets.iter().find(|p| p.index == index)
    }

    fn resolve(&self, id: u32) -> WatcherResult<&TypeInfo> {
        self.types
            .get(&id)
            .ok_or_else(|| WatcherError::Decode(format!("type {} missing from metadata", id)))
    }

    fn variant(&self, id: u32, index: u8) -> WatcherResult<&Variant> {
        match &self.resolve(id)?.def {
            TypeDef::Variant(variants) => variants
                .iter()
                .find(|v| v.index == index)
                .ok_or_else(|| {
                    WatcherError::Decode(format!("type {} has no variant {}", id, index))
                }),
            _ => Err(WatcherError::Decode(format!("type {} is not an enum", id))),
        }
    }

    /// Name the call at `pallet_index:call_index`
    pub fn lookup_call(&self, pallet_index: u8, call_index: u8) -> Option<CallEntry> {
        let pallet = self.pallet(pallet_index)?;
        let variant = self.variant(pallet.calls?, call_index).ok()?;
        Some(CallEntry {
            pallet_index,
            call_index,
            section: section_name(&pallet.name),
            method: camel_case(&variant.name),
        })
    }

    /// Decode a whole `System.Events` value; all input must be consumed
    pub fn decode_events(&self, bytes: &[u8]) -> WatcherResult<Vec<EventRecord>> {
        let input = &mut &bytes[..];
        let count = <Compact<u32>>::decode(input)?.0;

        let mut records = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            records.push(self.decode_record(input)?);
        }
        if !input.is_empty() {
            return Err(WatcherError::Decode(format!(
                "{} trailing bytes after {} events",
                input.len(),
                count
            )));
        }
        Ok(records)
    }

    fn decode_record(&self, input: &mut &[u8]) -> WatcherResult<EventRecord> {
        let phase = decode_phase(input)?;

        let pallet_index = u8::decode(input)?;
        let pallet = self.pallet(pallet_index).ok_or_else(|| {
            WatcherError::Decode(format!("no pallet {} in runtime {}", pallet_index, self.spec_version))
        })?;
        let event_type = pallet.event.ok_or_else(|| {
            WatcherError::Decode(format!("pallet {} has no events", pallet.name))
        })?;
        let variant = self.variant(event_type, u8::decode(input)?)?;

        let mut dispatch_error = None;
        for field in &variant.fields {
            if self.is_dispatch_error(field.ty.0) {
                dispatch_error = Some(self.describe_dispatch_error(field.ty.0, input)?);
            } else {
                self.skip(field.ty.0, input, 0)?;
            }
        }

        let topics = <Vec<[u8; 32]>>::decode(input)?
            .into_iter()
            .map(B256::from)
            .collect();

        Ok(EventRecord {
            phase,
            section: section_name(&pallet.name),
            method: variant.name.clone(),
            dispatch_error,
            topics,
        })
    }

    fn is_dispatch_error(&self, id: u32) -> bool {
        self.types
            .get(&id)
            .and_then(|t| t.path.last())
            .map_or(false, |name| name == "DispatchError")
    }

    fn describe_dispatch_error(&self, id: u32, input: &mut &[u8]) -> WatcherResult<String> {
        let start: &[u8] = *input;
        self.skip(id, input, 0)?;
        let consumed = &start[..start.len() - input.len()];

        let name = match consumed.first() {
            Some(index) => self.variant(id, *index)?.name.as_str(),
            None => return Err(WatcherError::Decode("empty dispatch error".to_string())),
        };
        Ok(match (name, consumed) {
            ("Module", [_, index, error, ..]) => {
                format!("Module {{ index: {}, error: {} }}", index, error)
            }
            (_, [_, inner]) => format!("{}({})", name, inner),
            _ => name.to_string(),
        })
    }

    /// Advance past one value of type `id`
    fn skip(&self, id: u32, input: &mut &[u8], depth: u32) -> WatcherResult<()> {
        if depth > MAX_TYPE_DEPTH {
            return Err(WatcherError::Decode(format!("type {} nests too deep", id)));
        }
        match &self.resolve(id)?.def {
            TypeDef::Composite(fields) => {
                for field in fields {
                    self.skip(field.ty.0, input, depth + 1)?;
                }
            }
            TypeDef::Variant(variants) => {
                let index = u8::decode(input)?;
                let variant = variants.iter().find(|v| v.index == index).ok_or_else(|| {
                    WatcherError::Decode(format!("type {} has no variant {}", id, index))
                })?;
                for field in &variant.fields {
                    self.skip(field.ty.0, input, depth + 1)?;
                }
            }
            TypeDef::Sequence(element) => {
                let len = <Compact<u32>>::decode(input)?.0;
                self.skip_elements(element.0, len, input, depth)?;
            }
            TypeDef::Array(len, element) => self.skip_elements(element.0, *len, input, depth)?,
            TypeDef::Tuple(elements) => {
                for element in elements {
                    self.skip(element.0, input, depth + 1)?;
                }
            }
            TypeDef::Primitive(primitive) => match primitive.size() {
                Some(size) => skip_bytes(input, size)?,
                None => {
                    <Vec<u8>>::decode(input)?;
                }
            },
            TypeDef::Compact(_) => {
                <Compact<u128>>::decode(input)?;
            }
            TypeDef::BitSequence(store, _) => {
                let bits = <Compact<u32>>::decode(input)?.0 as usize;
                let store_bytes = match &self.resolve(store.0)?.def {
                    TypeDef::Primitive(p) => p.size().unwrap_or(1),
                    _ => 1,
                };
                let store_bits = store_bytes * 8;
                skip_bytes(input, (bits + store_bits - 1) / store_bits * store_bytes)?;
            }
        }
        Ok(())
    }

    fn skip_elements(&self, element: u32, len: u32, input: &mut &[u8], depth: u32) -> WatcherResult<()> {
        if let TypeDef::Primitive(Primitive::U8) = self.resolve(element)?.def {
            return skip_bytes(input, len as usize);
        }
        // every element of a real event takes at least one byte
        if len as usize > input.len() {
            return Err(WatcherError::Decode(format!(
                "{} elements with {} bytes left",
                len,
                input.len()
            )));
        }
        for _ in 0..len {
            self.skip(element, input, depth + 1)?;
        }
        Ok(())
    }
}

/// `XcmPallet` -> `xcmPallet`
fn section_name(pallet: &str) -> String {
    let mut chars = pallet.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `transfer_keep_alive` -> `transferKeepAlive`
fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}
