use core::fmt;

use bincode::{Decode, Encode};
use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};
use log::{debug, info, warn};

use crate::tools::BINCODE_CONFIG;

pub const RECORD_SIZE: usize = 256;
pub const HEADER_SIZE: usize = 8;
pub const PAYLOAD_CAPACITY: usize = RECORD_SIZE - HEADER_SIZE;
pub const MAX_REGIONS_PER_SLOT: usize = 8;
pub const MIN_REGIONS_PER_SLOT: usize = 2;
pub const DEFAULT_REGIONS_PER_SLOT: usize = 4;
/// Generation field of an erased region.
pub const ERASED_GENERATION: u32 = u32::MAX;

const RECORD_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashFault {
    Locked,
    ProgramFailure,
    VerifyFailure,
    OutOfBounds,
}

impl fmt::Display for FlashFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Locked => "flash locked",
            Self::ProgramFailure => "flash program failure",
            Self::VerifyFailure => "flash verify failure",
            Self::OutOfBounds => "flash access out of bounds",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    Corrupt,
    WriteFailed(FlashFault),
    Locked,
    TooLarge,
    NoSuchSlot,
}

impl fmt::Display for StoreFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt => f.write_str("no valid record"),
            Self::WriteFailed(fault) => write!(f, "write failed: {}", fault),
            Self::Locked => f.write_str("slot locked"),
            Self::TooLarge => f.write_str("record too large"),
            Self::NoSuchSlot => f.write_str("no such slot"),
        }
    }
}

impl From<FlashFault> for StoreFault {
    fn from(fault: FlashFault) -> Self {
        match fault {
            FlashFault::Locked => StoreFault::Locked,
            other => StoreFault::WriteFailed(other),
        }
    }
}

/// Raw persistent memory split in equally sized, separately erasable regions.
///
/// Reads and writes start at the beginning of a region.
pub trait ByteStore {
    fn region_size(&self) -> usize;
    fn region_count(&self) -> usize;
    fn erase(&mut self, region: usize) -> Result<(), FlashFault>;
    fn write(&mut self, region: usize, data: &[u8]) -> Result<(), FlashFault>;
    fn read(&mut self, region: usize, buf: &mut [u8]) -> Result<(), FlashFault>;
}

/// [`ByteStore`] over a window of a NOR flash, one erase block (or more) per region.
pub struct FlashRegions<F> {
    flash: F,
    base: u32,
    region_size: usize,
    region_count: usize,
}

impl<F: NorFlash> FlashRegions<F> {
    pub fn new(flash: F, base: u32, region_count: usize) -> Self {
        let region_size = RECORD_SIZE.div_ceil(F::ERASE_SIZE) * F::ERASE_SIZE;
        let available = flash.capacity().saturating_sub(base as usize) / region_size;
        if available < region_count {
            warn!("flash window holds only {} of {} regions", available, region_count);
        }
        Self {
            flash,
            base,
            region_size,
            region_count: region_count.min(available),
        }
    }

    pub fn release(self) -> F {
        self.flash
    }

    fn offset(&self, region: usize) -> Result<u32, FlashFault> {
        if region >= self.region_count {
            return Err(FlashFault::OutOfBounds);
        }
        Ok(self.base + (region * self.region_size) as u32)
    }
}

fn flash_fault<E: NorFlashError>(e: E, fallback: FlashFault) -> FlashFault {
    match e.kind() {
        NorFlashErrorKind::NotAligned | NorFlashErrorKind::OutOfBounds => FlashFault::OutOfBounds,
        _ => fallback,
    }
}

impl<F: NorFlash> ByteStore for FlashRegions<F> {
    fn region_size(&self) -> usize {
        self.region_size
    }

    fn region_count(&self) -> usize {
        self.region_count
    }

    fn erase(&mut self, region: usize) -> Result<(), FlashFault> {
        let from = self.offset(region)?;
        self.flash
            .erase(from, from + self.region_size as u32)
            .map_err(|e| flash_fault(e, FlashFault::ProgramFailure))
    }

    fn write(&mut self, region: usize, data: &[u8]) -> Result<(), FlashFault> {
        if data.len() > self.region_size {
            return Err(FlashFault::OutOfBounds);
        }
        let offset = self.offset(region)?;
        self.flash
            .write(offset, data)
            .map_err(|e| flash_fault(e, FlashFault::ProgramFailure))
    }

    fn read(&mut self, region: usize, buf: &mut [u8]) -> Result<(), FlashFault> {
        if buf.len() > self.region_size {
            return Err(FlashFault::OutOfBounds);
        }
        let offset = self.offset(region)?;
        self.flash
            .read(offset, buf)
            .map_err(|e| flash_fault(e, FlashFault::ProgramFailure))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Slot(pub u8);

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLayout {
    pub regions_per_slot: usize,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self {
            regions_per_slot: DEFAULT_REGIONS_PER_SLOT,
        }
    }
}

fn record_checksum(record: &[u8; RECORD_SIZE]) -> u32 {
    let mut digest = RECORD_CRC.digest();
    digest.update(&record[0..4]);
    digest.update(&record[HEADER_SIZE..]);
    digest.finalize()
}

/// Generation of a record whose checksum matches, `None` for erased or damaged records.
fn valid_generation(record: &[u8; RECORD_SIZE]) -> Option<u32> {
    let generation = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
    let checksum = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);
    if generation == ERASED_GENERATION || checksum != record_checksum(record) {
        return None;
    }
    Some(generation)
}

/**
### Wear levelled record storage
* Each slot rotates through its own consecutive regions
* `save` writes generation + 1 into the region after the authoritative one
* `load` returns the newest record that checksums and decodes
*/
pub struct NonvolatileStore<B> {
    bytes: B,
    regions_per_slot: usize,
    slot_count: usize,
}

impl<B: ByteStore> NonvolatileStore<B> {
    pub fn new(bytes: B, layout: StoreLayout) -> Self {
        let regions_per_slot = layout
            .regions_per_slot
            .clamp(MIN_REGIONS_PER_SLOT, MAX_REGIONS_PER_SLOT);
        let slot_count = if bytes.region_size() < RECORD_SIZE {
            warn!("region of {} bytes cannot hold a record", bytes.region_size());
            0
        } else {
            bytes.region_count() / regions_per_slot
        };
        Self {
            bytes,
            regions_per_slot,
            slot_count,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn regions_per_slot(&self) -> usize {
        self.regions_per_slot
    }

    pub fn into_inner(self) -> B {
        self.bytes
    }

    fn first_region(&self, slot: Slot) -> Result<usize, StoreFault> {
        let slot = slot.0 as usize;
        if slot >= self.slot_count {
            return Err(StoreFault::NoSuchSlot);
        }
        Ok(slot * self.regions_per_slot)
    }

    fn read_record(&mut self, region: usize, record: &mut [u8; RECORD_SIZE]) -> Option<u32> {
        match self.bytes.read(region, record) {
            Ok(()) => valid_generation(record),
            Err(e) => {
                warn!("region {}: read failed: {}", region, e);
                None
            }
        }
    }

    /// Valid records of a slot as `(generation, region)`, newest first.
    fn candidates(&mut self, slot: Slot) -> Result<heapless::Vec<(u32, usize), MAX_REGIONS_PER_SLOT>, StoreFault> {
        let first = self.first_region(slot)?;
        let mut record = [0u8; RECORD_SIZE];
        let mut candidates = heapless::Vec::new();
        for region in first..first + self.regions_per_slot {
            if let Some(generation) = self.read_record(region, &mut record) {
                //ignore: capacity equals the max regions per slot
                let _ = candidates.push((generation, region));
            }
        }
        candidates.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        Ok(candidates)
    }

    pub fn latest_generation(&mut self, slot: Slot) -> Option<u32> {
        self.candidates(slot).ok()?.first().map(|(generation, _)| *generation)
    }

    pub fn load<T: Decode<()>>(&mut self, slot: Slot) -> Result<T, StoreFault> {
        let candidates = self.candidates(slot)?;
        let mut record = [0u8; RECORD_SIZE];
        for (generation, region) in candidates.iter() {
            if self.read_record(*region, &mut record) != Some(*generation) {
                continue;
            }
            match bincode::decode_from_slice::<T, _>(&record[HEADER_SIZE..], BINCODE_CONFIG) {
                Ok((value, _)) => {
                    debug!("{}: loaded generation {} from region {}", slot, generation, region);
                    return Ok(value);
                }
                Err(e) => warn!("{}: generation {} does not decode: {:?}", slot, generation, e),
            }
        }
        Err(StoreFault::Corrupt)
    }

    pub fn save<T: Encode>(&mut self, slot: Slot, value: &T) -> Result<(), StoreFault> {
        let first = self.first_region(slot)?;

        let mut record = [0xFFu8; RECORD_SIZE];
        if let Err(e) = bincode::encode_into_slice(value, &mut record[HEADER_SIZE..], BINCODE_CONFIG) {
            warn!("{}: encode failed: {:?}", slot, e);
            return Err(StoreFault::TooLarge);
        }

        let (generation, region) = match self.candidates(slot)?.first() {
            Some((generation, region)) => {
                let next = first + (region - first + 1) % self.regions_per_slot;
                (generation.wrapping_add(1), next)
            }
            None => (1, first),
        };
        record[0..4].copy_from_slice(&generation.to_le_bytes());
        let checksum = record_checksum(&record);
        record[4..8].copy_from_slice(&checksum.to_le_bytes());

        self.bytes.erase(region)?;
        self.bytes.write(region, &record)?;

        let mut verify = [0u8; RECORD_SIZE];
        self.bytes.read(region, &mut verify)?;
        if verify != record {
            warn!("{}: region {} verify failed", slot, region);
            return Err(StoreFault::WriteFailed(FlashFault::VerifyFailure));
        }

        info!("{}: saved generation {} to region {}", slot, generation, region);
        Ok(())
    }

    pub fn erase_slot(&mut self, slot: Slot) -> Result<(), StoreFault> {
        let first = self.first_region(slot)?;
        for region in first..first + self.regions_per_slot {
            self.bytes.erase(region)?;
        }
        Ok(())
    }
}
