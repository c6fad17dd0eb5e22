//! Chain event decoding
//!
//! Decodes the SCALE encoded `System.Events` storage value into event
//! records. Two historical encodings of the event record are supported:
//! - `Current`: weights are `{ ref_time: Compact<u64>, proof_size: Compact<u64> }`
//!   and module errors carry a 4 byte error index
//! - `Legacy`: weights are a plain `u64` and module errors a single byte
//!
//! When the registry carries the live runtime's metadata that is used first.
//! Otherwise the static table is tried with `Current`, then `Legacy`, and as a
//! last resort records the table does not know are stepped over.

pub mod metadata;
pub mod registry;

pub use metadata::RuntimeMetadata;
pub use registry::{FieldType, TypeRegistry};

use crate::error::{WatcherError, WatcherResult};

use alloy_primitives::B256;
use parity_scale_codec::{Compact, Decode, Input};
use std::fmt;
use tracing::debug;

/// Record decode attempts allowed while stepping over unknown events
const RESYNC_BUDGET: usize = 4096;

/// Encoding generation of the event record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRecordVersion {
    Current,
    Legacy,
}

impl EventRecordVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventRecordVersion::Current => "current",
            EventRecordVersion::Legacy => "legacy",
        }
    }
}

/// Block execution phase an event was emitted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ApplyExtrinsic(u32),
    Finalization,
    Initialization,
}

/// Result of dispatching an extrinsic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    Failed,
}

/// A decoded event record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub phase: Phase,
    pub section: String,
    pub method: String,
    /// Human readable dispatch error, for failed dispatches
    pub dispatch_error: Option<String>,
    pub topics: Vec<B256>,
}

impl EventRecord {
    /// Terminal dispatch outcome, if this is a `system.Extrinsic*` event
    pub fn dispatch_outcome(&self) -> Option<DispatchOutcome> {
        if self.section != "system" {
            return None;
        }
        match self.method.as_str() {
            "ExtrinsicSuccess" => Some(DispatchOutcome::Success),
            "ExtrinsicFailed" => Some(DispatchOutcome::Failed),
            _ => None,
        }
    }

    /// Extrinsic index this event belongs to
    pub fn extrinsic_index(&self) -> Option<u32> {
        match self.phase {
            Phase::ApplyExtrinsic(index) => Some(index),
            _ => None,
        }
    }
}

/// Layout that decoded a block's events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Runtime { spec_version: u32 },
    Static(EventRecordVersion),
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Runtime { spec_version } => write!(f, "runtime {}", spec_version),
            EventSource::Static(version) => write!(f, "{} encoding", version.as_str()),
        }
    }
}

/// Decoded events together with the layout that worked
#[derive(Debug, Clone)]
pub struct DecodedEvents {
    pub records: Vec<EventRecord>,
    pub source: EventSource,
    /// Records stepped over because no layout knew them
    pub skipped: usize,
}

/// Decode `System.Events` with the best layout available
pub fn decode_events(registry: &TypeRegistry, bytes: &[u8]) -> WatcherResult<DecodedEvents> {
    if let Some(runtime) = &registry.runtime {
        match runtime.decode_events(bytes) {
            Ok(records) => {
                return Ok(DecodedEvents {
                    records,
                    source: EventSource::Runtime {
                        spec_version: runtime.spec_version,
                    },
                    skipped: 0,
                })
            }
            Err(e) => debug!(
                "Runtime {} metadata failed on events ({}), trying static table",
                runtime.spec_version, e
            ),
        }
    }

    let current_err = match decode_event_records(registry, EventRecordVersion::Current, bytes) {
        Ok(records) => return Ok(static_events(records, EventRecordVersion::Current, 0)),
        Err(e) => e,
    };
    debug!(
        "Current event encoding failed ({}), trying legacy encoding",
        current_err
    );
    let legacy_err = match decode_event_records(registry, EventRecordVersion::Legacy, bytes) {
        Ok(records) => return Ok(static_events(records, EventRecordVersion::Legacy, 0)),
        Err(e) => e,
    };

    for version in [EventRecordVersion::Current, EventRecordVersion::Legacy] {
        if let Some((records, skipped)) = Resync::new(registry, version).run(bytes) {
            debug!(
                "Stepped over {} unknown events ({} encoding)",
                skipped,
                version.as_str()
            );
            return Ok(static_events(records, version, skipped));
        }
    }

    Err(WatcherError::Decode(format!(
        "events undecodable (current: {}; legacy: {})",
        current_err, legacy_err
    )))
}

fn static_events(
    records: Vec<EventRecord>,
    version: EventRecordVersion,
    skipped: usize,
) -> DecodedEvents {
    DecodedEvents {
        records,
        source: EventSource::Static(version),
        skipped,
    }
}

/// Static table decoding that steps over records it does not know.
///
/// An unknown record's fields have no known length, so every possible end
/// is tried until the topics and all following records decode and the
/// input is consumed exactly.
struct Resync<'a> {
    registry: &'a TypeRegistry,
    version: EventRecordVersion,
    budget: usize,
    skipped: usize,
}

impl<'a> Resync<'a> {
    fn new(registry: &'a TypeRegistry, version: EventRecordVersion) -> Self {
        Self {
            registry,
            version,
            budget: RESYNC_BUDGET,
            skipped: 0,
        }
    }

    fn run(mut self, bytes: &[u8]) -> Option<(Vec<EventRecord>, usize)> {
        let input = &mut &bytes[..];
        let count = <Compact<u32>>::decode(input).ok()?.0;
        let records = self.records(input, count)?;
        Some((records, self.skipped))
    }

    fn records(&mut self, mut input: &[u8], mut remaining: u32) -> Option<Vec<EventRecord>> {
        let mut records = Vec::new();
        loop {
            if remaining == 0 {
                return input.is_empty().then_some(records);
            }
            let mut cursor = input;
            match decode_record(self.registry, self.version, &mut cursor) {
                Ok(record) => {
                    records.push(record);
                    input = cursor;
                    remaining -= 1;
                }
                Err(_) => {
                    records.extend(self.step_over(input, remaining)?);
                    return Some(records);
                }
            }
        }
    }

    fn step_over(&mut self, input: &[u8], remaining: u32) -> Option<Vec<EventRecord>> {
        let mut header = input;
        decode_phase(&mut header).ok()?;
        // pallet and variant index
        let fields = header.get(2..)?;

        for end in 0..=fields.len() {
            if self.budget == 0 {
                return None;
            }
            self.budget -= 1;

            let mut cursor = &fields[end..];
            if <Vec<[u8; 32]>>::decode(&mut cursor).is_err() {
                continue;
            }
            if let Some(rest) = self.records(cursor, remaining - 1) {
                self.skipped += 1;
                return Some(rest);
            }
        }
        None
    }
}

/// Decode `System.Events` with one specific record encoding.
///
/// All input must be consumed, otherwise the encoding is considered wrong.
pub fn decode_event_records(
    registry: &TypeRegistry,
    version: EventRecordVersion,
    bytes: &[u8],
) -> WatcherResult<Vec<EventRecord>> {
    let input = &mut &bytes[..];
    let count = <Compact<u32>>::decode(input)?.0;

    let mut records = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        records.push(decode_record(registry, version, input)?);
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

fn decode_record(
    registry: &TypeRegistry,
    version: EventRecordVersion,
    input: &mut &[u8],
) -> WatcherResult<EventRecord> {
    let phase = decode_phase(input)?;

    let pallet_index = u8::decode(input)?;
    let variant_index = u8::decode(input)?;
    let entry = registry
        .lookup_event(pallet_index, variant_index)
        .ok_or_else(|| {
            WatcherError::Decode(format!(
                "event {}:{} not in registry {}",
                pallet_index, variant_index, registry.spec_name
            ))
        })?;

    let mut dispatch_error = None;
    for field in &entry.fields {
        if let Some(description) = skip_field(*field, version, input)? {
            dispatch_error = Some(description);
        }
    }

    let topics = <Vec<[u8; 32]>>::decode(input)?
        .into_iter()
        .map(B256::from)
        .collect();

    Ok(EventRecord {
        phase,
        section: entry.section.clone(),
        method: entry.method.clone(),
        dispatch_error,
        topics,
    })
}

fn decode_phase(input: &mut &[u8]) -> WatcherResult<Phase> {
    match u8::decode(input)? {
        0 => Ok(Phase::ApplyExtrinsic(u32::decode(input)?)),
        1 => Ok(Phase::Finalization),
        2 => Ok(Phase::Initialization),
        other => Err(WatcherError::Decode(format!("invalid phase {}", other))),
    }
}

/// Advance past one field; dispatch errors are described on the way
fn skip_field(
    field: FieldType,
    version: EventRecordVersion,
    input: &mut &[u8],
) -> WatcherResult<Option<String>> {
    match field {
        FieldType::U8 => skip_bytes(input, 1)?,
        FieldType::U16 => skip_bytes(input, 2)?,
        FieldType::U32 => skip_bytes(input, 4)?,
        FieldType::U64 => skip_bytes(input, 8)?,
        FieldType::U128 => skip_bytes(input, 16)?,
        FieldType::Bool => {
            bool::decode(input)?;
        }
        FieldType::AccountId32 | FieldType::H256 => skip_bytes(input, 32)?,
        FieldType::Compact => {
            <Compact<u128>>::decode(input)?;
        }
        FieldType::Bytes => {
            <Vec<u8>>::decode(input)?;
        }
        FieldType::DispatchInfo => skip_dispatch_info(version, input)?,
        FieldType::DispatchError => return decode_dispatch_error(version, input).map(Some),
    }
    Ok(None)
}

fn skip_bytes(input: &mut &[u8], len: usize) -> WatcherResult<()> {
    let mut buf = vec![0u8; len];
    input.read(&mut buf)?;
    Ok(())
}

fn skip_dispatch_info(version: EventRecordVersion, input: &mut &[u8]) -> WatcherResult<()> {
    match version {
        EventRecordVersion::Current => {
            <Compact<u64>>::decode(input)?;
            <Compact<u64>>::decode(input)?;
        }
        EventRecordVersion::Legacy => {
            u64::decode(input)?;
        }
    }

    let class = u8::decode(input)?;
    if class > 2 {
        return Err(WatcherError::Decode(format!("invalid dispatch class {}", class)));
    }
    let pays_fee = u8::decode(input)?;
    if pays_fee > 1 {
        return Err(WatcherError::Decode(format!("invalid pays fee {}", pays_fee)));
    }
    Ok(())
}

fn decode_dispatch_error(version: EventRecordVersion, input: &mut &[u8]) -> WatcherResult<String> {
    let description = match u8::decode(input)? {
        0 => "Other".to_string(),
        1 => "CannotLookup".to_string(),
        2 => "BadOrigin".to_string(),
        3 => {
            let index = u8::decode(input)?;
            let error = match version {
                EventRecordVersion::Current => <[u8; 4]>::decode(input)?[0],
                EventRecordVersion::Legacy => u8::decode(input)?,
            };
            format!("Module {{ index: {}, error: {} }}", index, error)
        }
        4 => "ConsumerRemaining".to_string(),
        5 => "NoProviders".to_string(),
        6 => "TooManyConsumers".to_string(),
        7 => format!("Token({})", u8::decode(input)?),
        8 => format!("Arithmetic({})", u8::decode(input)?),
        9 => format!("Transactional({})", u8::decode(input)?),
        10 => "Exhausted".to_string(),
        11 => "Corruption".to_string(),
        12 => "Unavailable".to_string(),
        13 => "RootNotAllowed".to_string(),
        other => {
            return Err(WatcherError::Decode(format!(
                "invalid dispatch error variant {}",
                other
            )))
        }
    };
    Ok(description)
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Builders for SCALE encoded `System.Events` values

    use super::EventRecordVersion;
    use parity_scale_codec::{Compact, Encode};

    /// One `system.ExtrinsicSuccess` / `system.ExtrinsicFailed` record
    pub fn dispatch_record(
        extrinsic_index: u32,
        success: bool,
        version: EventRecordVersion,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(0u8);
        out.extend(extrinsic_index.encode());
        out.push(0u8);
        if success {
            out.push(0u8);
        } else {
            out.push(1u8);
            // Module { index: 5, error: 2 }
            out.push(3u8);
            out.push(5u8);
            match version {
                EventRecordVersion::Current => out.extend([2u8, 0, 0, 0]),
                EventRecordVersion::Legacy => out.push(2u8),
            }
        }
        match version {
            EventRecordVersion::Current => {
                out.extend(Compact(1_000_000u64).encode());
                out.extend(Compact(3_593u64).encode());
            }
            EventRecordVersion::Legacy => out.extend(1_000_000u64.encode()),
        }
        // class: normal, pays_fee: yes
        out.extend([0u8, 0u8]);
        out.extend(Compact(0u32).encode());
        out
    }

    /// `balances.Withdraw` record for the given extrinsic
    pub fn withdraw_record(extrinsic_index: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(0u8);
        out.extend(extrinsic_index.encode());
        out.extend([5u8, 8u8]);
        out.extend([7u8; 32]);
        out.extend(150_000_000u128.encode());
        out.extend(Compact(0u32).encode());
        out
    }

    pub fn events(records: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Compact(records.len() as u32).encode();
        for record in records {
            out.extend(record);
        }
        out
    }
}
