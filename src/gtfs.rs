use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TooLong;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    TripId,
    StopId,
    ArrivalTime,
    DepartureTime,
    StopSequence,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::TripId,
        Field::StopId,
        Field::ArrivalTime,
        Field::DepartureTime,
        Field::StopSequence,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::TripId => "trip_id",
            Field::StopId => "stop_id",
            Field::ArrivalTime => "arrival_time",
            Field::DepartureTime => "departure_time",
            Field::StopSequence => "stop_sequence",
        }
    }

    pub fn from_name(name: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|field| field.name() == name)
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A UTF-8 string of at most `MAX` bytes. Construction never truncates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BoundedString<const MAX: usize>(String);

impl<const MAX: usize> BoundedString<MAX> {
    pub fn new(value: &str) -> Result<Self, TooLong> {
        if value.len() > MAX {
            return Err(TooLong {
                len: value.len(),
                max: MAX,
            });
        }
        Ok(Self(value.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<const MAX: usize> TryFrom<String> for BoundedString<MAX> {
    type Error = TooLong;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() > MAX {
            return Err(TooLong {
                len: value.len(),
                max: MAX,
            });
        }
        Ok(Self(value))
    }
}

impl<const MAX: usize> fmt::Display for BoundedString<MAX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<const MAX: usize> Serialize for BoundedString<MAX> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de, const MAX: usize> Deserialize<'de> for BoundedString<MAX> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::try_from(value).map_err(serde::de::Error::custom)
    }
}

pub type IdString = BoundedString<63>;
pub type TimeString = BoundedString<15>;

/// One scheduled stop visit. Field order is the encoded key order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRow {
    pub trip_id: IdString,
    pub stop_id: IdString,
    pub arrival_time: TimeString,
    pub departure_time: TimeString,
    pub stop_sequence: i32,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Document {
    pub stop_times: Vec<ScheduleRow>,
}

pub const DOCUMENT_KEY: &str = "stop_times";
