//! Turn-by-turn instruction classification.
//!
//! The directions service returns free-text maneuver descriptions
//! ("Turn left onto Rua da Praia"). This module maps them onto a closed
//! set of maneuver kinds the host can pick icons and voice prompts for,
//! and pulls out the street name. Classification is pure and
//! deterministic.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::geo::Coordinate;

/// Compass direction used by "Head ..." instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompassDirection {
    North,
    Northeast,
    East,
    Southeast,
    South,
    Southwest,
    West,
    Northwest,
}

impl CompassDirection {
    fn from_word(word: &str) -> Option<Self> {
        Some(match word {
            "north" => CompassDirection::North,
            "northeast" => CompassDirection::Northeast,
            "east" => CompassDirection::East,
            "southeast" => CompassDirection::Southeast,
            "south" => CompassDirection::South,
            "southwest" => CompassDirection::Southwest,
            "west" => CompassDirection::West,
            "northwest" => CompassDirection::Northwest,
            _ => return None,
        })
    }
}

/// Maneuver categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManeuverKey {
    Head(CompassDirection),
    TurnLeft,
    TurnRight,
    TurnSharpLeft,
    TurnSharpRight,
    TurnSlightLeft,
    TurnSlightRight,
    ContinueStraight,
    KeepLeft,
    KeepRight,
    UTurn,
    EnterRoundabout,
    ExitRoundabout,
    Ferry,
    EndOfRoad,
    Arrive,
    Unknown,
}

impl ManeuverKey {
    /// Stable snake_case key, e.g. `turn_sharp_left` or `head_north`.
    pub fn as_key(self) -> &'static str {
        match self {
            ManeuverKey::Head(dir) => match dir {
                CompassDirection::North => "head_north",
                CompassDirection::Northeast => "head_northeast",
                CompassDirection::East => "head_east",
                CompassDirection::Southeast => "head_southeast",
                CompassDirection::South => "head_south",
                CompassDirection::Southwest => "head_southwest",
                CompassDirection::West => "head_west",
                CompassDirection::Northwest => "head_northwest",
            },
            ManeuverKey::TurnLeft => "turn_left",
            ManeuverKey::TurnRight => "turn_right",
            ManeuverKey::TurnSharpLeft => "turn_sharp_left",
            ManeuverKey::TurnSharpRight => "turn_sharp_right",
            ManeuverKey::TurnSlightLeft => "turn_slight_left",
            ManeuverKey::TurnSlightRight => "turn_slight_right",
            ManeuverKey::ContinueStraight => "continue_straight",
            ManeuverKey::KeepLeft => "keep_left",
            ManeuverKey::KeepRight => "keep_right",
            ManeuverKey::UTurn => "u_turn",
            ManeuverKey::EnterRoundabout => "enter_roundabout",
            ManeuverKey::ExitRoundabout => "exit_roundabout",
            ManeuverKey::Ferry => "ferry",
            ManeuverKey::EndOfRoad => "end_of_road",
            ManeuverKey::Arrive => "arrive",
            ManeuverKey::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ManeuverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

impl Serialize for ManeuverKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_key())
    }
}

/// Classification result for one instruction text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedInstruction {
    pub maneuver: ManeuverKey,
    pub street_name: String,
}

/// A single turn-by-turn step of the active route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructionStep {
    /// Position of this step in the route (0-based).
    pub index: usize,
    pub maneuver: ManeuverKey,
    pub street_name: String,
    /// Length of the step in meters.
    pub distance_m: f64,
    /// Where the maneuver takes place.
    pub lat: f64,
    pub lon: f64,
    pub raw_text: String,
}

impl InstructionStep {
    /// Classify `raw_text` and build a step at `location`.
    pub fn from_text(index: usize, raw_text: &str, distance_m: f64, location: Coordinate) -> Self {
        let parsed = parse(raw_text);
        Self {
            index,
            maneuver: parsed.maneuver,
            street_name: parsed.street_name,
            distance_m,
            lat: location.lat,
            lon: location.lon,
            raw_text: raw_text.to_string(),
        }
    }

    pub fn location(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }
}

/// Tokens after which the street name begins.
const PREPOSITIONS: [&str; 3] = ["on", "onto", "in"];

/// Tokens that end the maneuver phrase. Anything after them names a
/// street or a landmark and is never classified.
const PHRASE_BOUNDARIES: [&str; 4] = ["on", "onto", "in", "at"];

/// Classify a raw maneuver text and extract the street name.
pub fn parse(raw_text: &str) -> ParsedInstruction {
    ParsedInstruction {
        maneuver: classify(raw_text),
        street_name: extract_street_name(raw_text),
    }
}

/// Map instruction text onto a maneuver kind.
///
/// Order matters: "Turn sharp left" must not be caught by the plain
/// "turn left" rule, and "Enter the roundabout and take the 2nd exit"
/// is an entry even though it mentions an exit. Only the words before
/// the first boundary are read, so "Turn right onto Left Bank Road" is a
/// right turn. A leading boundary ("At the end of the road") is part of
/// the phrase.
fn classify(raw_text: &str) -> ManeuverKey {
    let lowered = raw_text.trim().to_lowercase();
    let all_words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .collect();
    let end = all_words
        .iter()
        .skip(1)
        .position(|w| PHRASE_BOUNDARIES.contains(w))
        .map_or(all_words.len(), |p| p + 1);
    let words = &all_words[..end];
    let text = words.join(" ");

    if words.first() == Some(&"head") {
        return words
            .get(1)
            .and_then(|w| CompassDirection::from_word(w))
            .map(ManeuverKey::Head)
            .unwrap_or(ManeuverKey::Unknown);
    }

    if text.contains("u-turn") || text.contains("uturn") || text.contains("u turn") {
        return ManeuverKey::UTurn;
    }

    if text.contains("roundabout") {
        return if words.contains(&"enter") || !words.contains(&"exit") {
            ManeuverKey::EnterRoundabout
        } else {
            ManeuverKey::ExitRoundabout
        };
    }

    if words.contains(&"ferry") {
        return ManeuverKey::Ferry;
    }

    if text.contains("end of the road") || text.contains("end of road") {
        return ManeuverKey::EndOfRoad;
    }

    let left = words.contains(&"left");
    let right = words.contains(&"right");

    if words.contains(&"sharp") {
        if left {
            return ManeuverKey::TurnSharpLeft;
        }
        if right {
            return ManeuverKey::TurnSharpRight;
        }
    }

    if words.contains(&"slight") || words.contains(&"slightly") {
        if left {
            return ManeuverKey::TurnSlightLeft;
        }
        if right {
            return ManeuverKey::TurnSlightRight;
        }
    }

    if words.contains(&"keep") {
        if left {
            return ManeuverKey::KeepLeft;
        }
        if right {
            return ManeuverKey::KeepRight;
        }
    }

    if words.contains(&"turn") {
        if left {
            return ManeuverKey::TurnLeft;
        }
        if right {
            return ManeuverKey::TurnRight;
        }
    }

    if words.contains(&"continue") || words.contains(&"straight") {
        return ManeuverKey::ContinueStraight;
    }

    if words.first() == Some(&"arrive") {
        return ManeuverKey::Arrive;
    }

    ManeuverKey::Unknown
}

/// Street name: the words after the first preposition in the first
/// clause. Text after a comma ("..., on the right") is a side note, not
/// part of the street.
fn extract_street_name(raw_text: &str) -> String {
    let clause = raw_text.split(',').next().unwrap_or_default();
    let words: Vec<&str> = clause.split_whitespace().collect();

    let Some(pos) = words
        .iter()
        .position(|w| PREPOSITIONS.contains(&w.to_lowercase().as_str()))
    else {
        return String::new();
    };

    words[pos + 1..]
        .join(" ")
        .trim_end_matches('.')
        .trim()
        .to_string()
}
