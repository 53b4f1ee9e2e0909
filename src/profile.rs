use core::fmt;

use bincode::{Decode, Encode};
use log::warn;

use crate::storage::{ByteStore, NonvolatileStore, Slot, StoreFault};

pub const MAX_WAYPOINTS: usize = 16;
pub const MIN_WAYPOINTS: usize = 2;
pub const NAME_LEN: usize = 20;
pub const MIN_TARGET_C: f32 = 0.0;
pub const MAX_TARGET_C: f32 = 300.0;

pub const BUILTIN_COUNT: usize = 4;
pub const PROFILE_COUNT: usize = 10;
/// Slot of the first user profile, slots below hold calibration and settings.
pub const FIRST_PROFILE_SLOT: u8 = 2;

const BUILTIN_RAMP_C_PER_S: f32 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Encode, Decode)]
pub struct Waypoint {
    pub time_s: u16,
    pub target_c: f32,
}

impl Waypoint {
    pub const fn new(time_s: u16, target_c: f32) -> Self {
        Self { time_s, target_c }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileInvalid {
    TooFewWaypoints,
    TooManyWaypoints,
    BadName,
    TimeNotIncreasing { index: usize },
    TemperatureOutOfRange { index: usize },
    RampTooSteep { index: usize },
    BadRampCeiling,
}

impl fmt::Display for ProfileInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewWaypoints => f.write_str("too few waypoints"),
            Self::TooManyWaypoints => f.write_str("too many waypoints"),
            Self::BadName => f.write_str("bad profile name"),
            Self::TimeNotIncreasing { index } => write!(f, "waypoint {}: time not increasing", index),
            Self::TemperatureOutOfRange { index } => write!(f, "waypoint {}: temperature out of range", index),
            Self::RampTooSteep { index } => write!(f, "waypoint {}: ramp too steep", index),
            Self::BadRampCeiling => f.write_str("bad ramp ceiling"),
        }
    }
}

/// A validated reflow profile.
///
/// Only obtainable through [`SolderProfile::new`], so every value upholds the
/// waypoint invariants.
#[derive(Debug, Clone, PartialEq)]
pub struct SolderProfile {
    name: heapless::String<NAME_LEN>,
    waypoints: heapless::Vec<Waypoint, MAX_WAYPOINTS>,
    max_ramp_c_per_s: f32,
}

impl SolderProfile {
    pub fn new(name: &str, waypoints: &[Waypoint], max_ramp_c_per_s: f32) -> Result<Self, ProfileInvalid> {
        if name.is_empty() {
            return Err(ProfileInvalid::BadName);
        }
        let name = heapless::String::try_from(name).map_err(|_| ProfileInvalid::BadName)?;
        if waypoints.len() < MIN_WAYPOINTS {
            return Err(ProfileInvalid::TooFewWaypoints);
        }
        let waypoints = heapless::Vec::from_slice(waypoints).map_err(|_| ProfileInvalid::TooManyWaypoints)?;
        if !max_ramp_c_per_s.is_finite() || max_ramp_c_per_s <= 0.0 {
            return Err(ProfileInvalid::BadRampCeiling);
        }

        let mut prev: Option<&Waypoint> = None;
        for (index, waypoint) in waypoints.iter().enumerate() {
            if !(MIN_TARGET_C..=MAX_TARGET_C).contains(&waypoint.target_c) {
                return Err(ProfileInvalid::TemperatureOutOfRange { index });
            }
            if let Some(prev) = prev {
                if waypoint.time_s <= prev.time_s {
                    return Err(ProfileInvalid::TimeNotIncreasing { index });
                }
                let dt = (waypoint.time_s - prev.time_s) as f32;
                let slope = (waypoint.target_c - prev.target_c) / dt;
                if slope > max_ramp_c_per_s || -slope > max_ramp_c_per_s {
                    return Err(ProfileInvalid::RampTooSteep { index });
                }
            }
            prev = Some(waypoint);
        }

        Ok(Self {
            name,
            waypoints,
            max_ramp_c_per_s,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn max_ramp_c_per_s(&self) -> f32 {
        self.max_ramp_c_per_s
    }

    pub fn duration_s(&self) -> u16 {
        self.waypoints.last().map_or(0, |w| w.time_s)
    }

    pub fn peak_c(&self) -> f32 {
        self.waypoints
            .iter()
            .map(|w| w.target_c)
            .fold(MIN_TARGET_C, f32::max)
    }

    /**
    ### Setpoint at a point of the run
    * Linear interpolation between the waypoints bracketing `elapsed_s`
    * Returns the index of the segment start together with the setpoint
    * Holds the first target before the first waypoint and the last one after the end
    */
    pub fn setpoint_at(&self, elapsed_s: f32) -> (usize, f32) {
        let last = self.waypoints.len() - 1;
        let first = &self.waypoints[0];
        if elapsed_s.is_nan() || elapsed_s <= first.time_s as f32 {
            return (0, first.target_c);
        }
        for (index, pair) in self.waypoints.windows(2).enumerate() {
            let (from, to) = (&pair[0], &pair[1]);
            if elapsed_s < to.time_s as f32 {
                let span = (to.time_s - from.time_s) as f32;
                let fraction = (elapsed_s - from.time_s as f32) / span;
                return (index, from.target_c + (to.target_c - from.target_c) * fraction);
            }
        }
        (last, self.waypoints[last].target_c)
    }
}

/// Fixed size flash representation of a [`SolderProfile`].
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ProfileRecord {
    name_len: u8,
    name: [u8; NAME_LEN],
    waypoint_count: u8,
    waypoints: [Waypoint; MAX_WAYPOINTS],
    max_ramp_c_per_s: f32,
}

impl From<&SolderProfile> for ProfileRecord {
    fn from(profile: &SolderProfile) -> Self {
        let mut name = [0u8; NAME_LEN];
        name[..profile.name.len()].copy_from_slice(profile.name.as_bytes());
        let mut waypoints = [Waypoint::default(); MAX_WAYPOINTS];
        waypoints[..profile.waypoints.len()].copy_from_slice(&profile.waypoints);
        Self {
            name_len: profile.name.len() as u8,
            name,
            waypoint_count: profile.waypoints.len() as u8,
            waypoints,
            max_ramp_c_per_s: profile.max_ramp_c_per_s,
        }
    }
}

impl TryFrom<&ProfileRecord> for SolderProfile {
    type Error = ProfileInvalid;

    fn try_from(record: &ProfileRecord) -> Result<Self, Self::Error> {
        let name = record
            .name
            .get(..record.name_len as usize)
            .and_then(|bytes| core::str::from_utf8(bytes).ok())
            .ok_or(ProfileInvalid::BadName)?;
        let waypoints = record
            .waypoints
            .get(..record.waypoint_count as usize)
            .ok_or(ProfileInvalid::TooManyWaypoints)?;
        SolderProfile::new(name, waypoints, record.max_ramp_c_per_s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileLoadError {
    Store(StoreFault),
    Invalid(ProfileInvalid),
}

impl From<StoreFault> for ProfileLoadError {
    fn from(fault: StoreFault) -> Self {
        Self::Store(fault)
    }
}

impl From<ProfileInvalid> for ProfileLoadError {
    fn from(invalid: ProfileInvalid) -> Self {
        Self::Invalid(invalid)
    }
}

impl fmt::Display for ProfileLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(fault) => write!(f, "profile not loaded: {}", fault),
            Self::Invalid(invalid) => write!(f, "profile rejected: {}", invalid),
        }
    }
}

const BUILTIN_4300_A: [Waypoint; 6] = [
    Waypoint::new(0, 25.0),
    Waypoint::new(115, 140.0),
    Waypoint::new(205, 183.0),
    Waypoint::new(225, 210.0),
    Waypoint::new(240, 210.0),
    Waypoint::new(294, 50.0),
];

const BUILTIN_4300_B: [Waypoint; 6] = [
    Waypoint::new(0, 25.0),
    Waypoint::new(115, 140.0),
    Waypoint::new(235, 183.0),
    Waypoint::new(255, 210.0),
    Waypoint::new(270, 210.0),
    Waypoint::new(324, 50.0),
];

const BUILTIN_NC31: [Waypoint; 6] = [
    Waypoint::new(0, 25.0),
    Waypoint::new(65, 90.0),
    Waypoint::new(140, 140.0),
    Waypoint::new(147, 160.0),
    Waypoint::new(162, 160.0),
    Waypoint::new(199, 50.0),
];

const BUILTIN_SYNTECH_LF: [Waypoint; 6] = [
    Waypoint::new(0, 25.0),
    Waypoint::new(115, 140.0),
    Waypoint::new(190, 200.0),
    Waypoint::new(204, 240.0),
    Waypoint::new(224, 240.0),
    Waypoint::new(288, 50.0),
];

const BUILTINS: [(&str, &[Waypoint]); BUILTIN_COUNT] = [
    ("4300 63SN/37PB-a", &BUILTIN_4300_A),
    ("4300 63SN/37PB-b", &BUILTIN_4300_B),
    ("NC-31 LOW-TEMP LF", &BUILTIN_NC31),
    ("AMTECH SYNTECH-LF", &BUILTIN_SYNTECH_LF),
];

pub fn builtin_profile(index: usize) -> Option<SolderProfile> {
    let (name, waypoints) = BUILTINS.get(index)?;
    SolderProfile::new(name, waypoints, BUILTIN_RAMP_C_PER_S).ok()
}

/// Built-in profiles cannot be overwritten.
pub fn is_locked(index: usize) -> bool {
    index < BUILTIN_COUNT
}

pub fn profile_slot(index: usize) -> Option<Slot> {
    if is_locked(index) || index >= PROFILE_COUNT {
        return None;
    }
    Some(Slot(FIRST_PROFILE_SLOT + (index - BUILTIN_COUNT) as u8))
}

pub fn load_profile<B: ByteStore>(
    store: &mut NonvolatileStore<B>,
    index: usize,
) -> Result<SolderProfile, ProfileLoadError> {
    if let Some(profile) = builtin_profile(index) {
        return Ok(profile);
    }
    let slot = profile_slot(index).ok_or(StoreFault::NoSuchSlot)?;
    let record: ProfileRecord = store.load(slot)?;
    SolderProfile::try_from(&record).map_err(|e| {
        warn!("profile {}: stored record rejected: {}", index, e);
        ProfileLoadError::Invalid(e)
    })
}

pub fn save_profile<B: ByteStore>(
    store: &mut NonvolatileStore<B>,
    index: usize,
    profile: &SolderProfile,
) -> Result<(), StoreFault> {
    if is_locked(index) {
        return Err(StoreFault::Locked);
    }
    let slot = profile_slot(index).ok_or(StoreFault::NoSuchSlot)?;
    store.save(slot, &ProfileRecord::from(profile))
}

pub fn copy_profile<B: ByteStore>(
    store: &mut NonvolatileStore<B>,
    from: usize,
    to: usize,
) -> Result<(), ProfileLoadError> {
    let profile = load_profile(store, from)?;
    save_profile(store, to, &profile)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{tests::RamFlash, StoreLayout};

    fn ramp() -> SolderProfile {
        SolderProfile::new(
            "ramp",
            &[
                Waypoint::new(0, 25.0),
                Waypoint::new(60, 150.0),
                Waypoint::new(120, 150.0),
            ],
            3.0,
        )
        .unwrap()
    }

    fn store() -> NonvolatileStore<RamFlash> {
        NonvolatileStore::new(RamFlash::new(32), StoreLayout::default())
    }

    #[test]
    fn interpolates_setpoint() {
        let profile = ramp();
        assert_eq!(profile.setpoint_at(0.0), (0, 25.0));
        assert_eq!(profile.setpoint_at(30.0), (0, 87.5));
        assert_eq!(profile.setpoint_at(60.0), (1, 150.0));
        assert_eq!(profile.setpoint_at(90.0), (1, 150.0));
        assert_eq!(profile.setpoint_at(500.0), (2, 150.0));
        assert_eq!(profile.duration_s(), 120);
        assert_eq!(profile.peak_c(), 150.0);
    }

    #[test]
    fn rejects_malformed_profiles() {
        let ok = Waypoint::new(0, 25.0);
        assert_eq!(SolderProfile::new("x", &[ok], 3.0), Err(ProfileInvalid::TooFewWaypoints));
        assert_eq!(
            SolderProfile::new("x", &[ok, Waypoint::new(0, 30.0)], 3.0),
            Err(ProfileInvalid::TimeNotIncreasing { index: 1 })
        );
        assert_eq!(
            SolderProfile::new("x", &[ok, Waypoint::new(100, 301.0)], 3.0),
            Err(ProfileInvalid::TemperatureOutOfRange { index: 1 })
        );
        assert_eq!(
            SolderProfile::new("x", &[ok, Waypoint::new(10, 100.0)], 3.0),
            Err(ProfileInvalid::RampTooSteep { index: 1 })
        );
        assert_eq!(
            SolderProfile::new("x", &[Waypoint::new(0, 250.0), Waypoint::new(10, 100.0)], 3.0),
            Err(ProfileInvalid::RampTooSteep { index: 1 })
        );
        assert_eq!(
            SolderProfile::new("x", &[ok, Waypoint::new(10, f32::NAN)], 3.0),
            Err(ProfileInvalid::TemperatureOutOfRange { index: 1 })
        );
        assert_eq!(
            SolderProfile::new("x", &[ok, Waypoint::new(100, 50.0)], 0.0),
            Err(ProfileInvalid::BadRampCeiling)
        );
        assert_eq!(
            SolderProfile::new("a name that is far too long", &[ok, Waypoint::new(100, 50.0)], 3.0),
            Err(ProfileInvalid::BadName)
        );
        let many: [Waypoint; MAX_WAYPOINTS + 1] = core::array::from_fn(|i| Waypoint::new(i as u16, 25.0));
        assert_eq!(SolderProfile::new("x", &many, 3.0), Err(ProfileInvalid::TooManyWaypoints));
    }

    #[test]
    fn builtins_are_valid_and_locked() {
        for index in 0..BUILTIN_COUNT {
            let profile = builtin_profile(index).unwrap();
            assert!(profile.peak_c() >= 160.0);
            assert!(is_locked(index));
            assert_eq!(profile_slot(index), None);
        }
        assert!(builtin_profile(BUILTIN_COUNT).is_none());
        assert_eq!(builtin_profile(3).unwrap().peak_c(), 240.0);
    }

    #[test]
    fn user_profiles_map_to_slots() {
        assert_eq!(profile_slot(4), Some(Slot(FIRST_PROFILE_SLOT)));
        assert_eq!(profile_slot(9), Some(Slot(FIRST_PROFILE_SLOT + 5)));
        assert_eq!(profile_slot(PROFILE_COUNT), None);
    }

    #[test]
    fn record_round_trip() {
        let profile = builtin_profile(2).unwrap();
        let record = ProfileRecord::from(&profile);
        assert_eq!(SolderProfile::try_from(&record), Ok(profile));
    }

    #[test]
    fn save_and_load_user_profile() {
        let mut store = store();
        let profile = ramp();
        save_profile(&mut store, 5, &profile).unwrap();
        assert_eq!(load_profile(&mut store, 5), Ok(profile));
        assert_eq!(
            load_profile(&mut store, 6),
            Err(ProfileLoadError::Store(StoreFault::Corrupt))
        );
    }

    #[test]
    fn builtins_cannot_be_overwritten() {
        let mut store = store();
        assert_eq!(save_profile(&mut store, 0, &ramp()), Err(StoreFault::Locked));
        assert_eq!(save_profile(&mut store, PROFILE_COUNT, &ramp()), Err(StoreFault::NoSuchSlot));
    }

    #[test]
    fn copy_builtin_into_user_slot() {
        let mut store = store();
        copy_profile(&mut store, 1, 4).unwrap();
        assert_eq!(load_profile(&mut store, 4), Ok(builtin_profile(1).unwrap()));
        assert_eq!(
            copy_profile(&mut store, 4, 2),
            Err(ProfileLoadError::Store(StoreFault::Locked))
        );
    }

    #[test]
    fn stored_invalid_record_is_rejected() {
        let mut store = store();
        let mut record = ProfileRecord::from(&ramp());
        record.waypoints[1].target_c = 900.0;
        store.save(Slot(FIRST_PROFILE_SLOT), &record).unwrap();
        assert_eq!(
            load_profile(&mut store, 4),
            Err(ProfileLoadError::Invalid(ProfileInvalid::TemperatureOutOfRange { index: 1 }))
        );
    }
}
