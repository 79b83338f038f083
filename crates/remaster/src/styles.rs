//! Console styles and their program tables.
//!
//! Tables are plain data: installed once per process into a [`OnceLock`] and
//! read without locking afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use midi_analysis::InstrumentCategory;
use remasterconf::StyleOverride;
use serde::{Deserialize, Serialize};

use crate::error::RemasterError;

/// Target console style. Each has a soundfont named `<id>.sf2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStyle {
    Snes,
    Gba,
    Nds,
    Ps2,
    Wii,
}

impl ConsoleStyle {
    pub const ALL: [ConsoleStyle; 5] = [Self::Snes, Self::Gba, Self::Nds, Self::Ps2, Self::Wii];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snes => "snes",
            Self::Gba => "gba",
            Self::Nds => "nds",
            Self::Ps2 => "ps2",
            Self::Wii => "wii",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Snes => 0,
            Self::Gba => 1,
            Self::Nds => 2,
            Self::Ps2 => 3,
            Self::Wii => 4,
        }
    }
}

impl fmt::Display for ConsoleStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsoleStyle {
    type Err = RemasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|style| style.as_str() == wanted)
            .ok_or_else(|| RemasterError::UnknownStyle(s.to_string()))
    }
}

/// Category → program for one style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramTable {
    programs: BTreeMap<InstrumentCategory, u8>,
    default_category: InstrumentCategory,
    kit_program: u8,
}

/// Where a category landed in a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramChoice {
    pub program: u8,
    /// The category whose entry supplied `program`. Differs from the
    /// requested category when the table fell back to its default.
    pub category: InstrumentCategory,
}

impl ProgramTable {
    /// Build a table. `default_category` must have an entry and cannot be
    /// percussion, which always uses `kit_program`.
    pub fn new(
        programs: BTreeMap<InstrumentCategory, u8>,
        default_category: InstrumentCategory,
        kit_program: u8,
    ) -> Result<Self, String> {
        if default_category == InstrumentCategory::Percussion {
            return Err("default category cannot be percussion".to_string());
        }
        if !programs.contains_key(&default_category) {
            return Err(format!("default category {default_category} has no program"));
        }
        if let Some((category, program)) = programs.iter().find(|(_, p)| **p > 127) {
            return Err(format!("program {program} for {category} is outside 0-127"));
        }
        if kit_program > 127 {
            return Err(format!("kit program {kit_program} is outside 0-127"));
        }
        Ok(Self {
            programs,
            default_category,
            kit_program,
        })
    }

    /// Built-in table for a style.
    pub fn builtin(style: ConsoleStyle) -> Self {
        use InstrumentCategory::*;
        let (entries, default_category) = match style {
            ConsoleStyle::Snes => (vec![(Lead, 73), (Bass, 32), (Pad, 48), (Keys, 46)], Lead),
            ConsoleStyle::Gba => (vec![(Lead, 80), (Bass, 38), (Pad, 92), (Other, 81)], Lead),
            ConsoleStyle::Nds => (
                vec![(Lead, 25), (Bass, 35), (Pad, 16), (Keys, 4), (Other, 14)],
                Keys,
            ),
            ConsoleStyle::Ps2 => (
                vec![(Lead, 56), (Bass, 33), (Pad, 49), (Keys, 0), (Other, 60)],
                Keys,
            ),
            ConsoleStyle::Wii => (vec![(Lead, 72), (Bass, 43), (Pad, 42), (Keys, 1)], Pad),
        };
        Self {
            programs: entries.into_iter().collect(),
            default_category,
            kit_program: 0,
        }
    }

    /// Program for a category; never fails.
    pub fn program_for(&self, category: InstrumentCategory) -> ProgramChoice {
        if category == InstrumentCategory::Percussion {
            return ProgramChoice {
                program: self.kit_program,
                category,
            };
        }
        match self.programs.get(&category) {
            Some(&program) => ProgramChoice { program, category },
            None => ProgramChoice {
                program: self.programs.get(&self.default_category).copied().unwrap_or(0),
                category: self.default_category,
            },
        }
    }

    pub fn default_category(&self) -> InstrumentCategory {
        self.default_category
    }

    pub fn kit_program(&self) -> u8 {
        self.kit_program
    }

    pub fn has_entry(&self, category: InstrumentCategory) -> bool {
        category == InstrumentCategory::Percussion || self.programs.contains_key(&category)
    }

    /// Apply a config override on top of this table.
    pub fn overridden(&self, o: &StyleOverride) -> Result<Self, String> {
        let mut programs = self.programs.clone();
        let mut kit_program = self.kit_program;
        for (key, program) in o.programs() {
            if key == "kit" {
                kit_program = program;
                continue;
            }
            let category: InstrumentCategory = key.parse()?;
            programs.insert(category, program);
        }
        let default_category = match &o.default_category {
            Some(name) => name.parse()?,
            None => self.default_category,
        };
        Self::new(programs, default_category, kit_program)
    }
}

/// Tables for all five styles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleBank {
    tables: [ProgramTable; 5],
}

impl StyleBank {
    pub fn builtin() -> Self {
        Self {
            tables: ConsoleStyle::ALL.map(ProgramTable::builtin),
        }
    }

    /// Built-in tables with `[styles.<id>]` overrides applied.
    pub fn with_overrides(overrides: &BTreeMap<String, StyleOverride>) -> Result<Self, RemasterError> {
        let mut bank = Self::builtin();
        for (id, o) in overrides {
            let style: ConsoleStyle = id.parse()?;
            let table = bank.tables[style.index()]
                .overridden(o)
                .map_err(|e| RemasterError::Processing(format!("styles.{id}: {e}")))?;
            bank.tables[style.index()] = table;
        }
        Ok(bank)
    }

    pub fn table(&self, style: ConsoleStyle) -> &ProgramTable {
        &self.tables[style.index()]
    }
}

impl Default for StyleBank {
    fn default() -> Self {
        Self::builtin()
    }
}

static STYLE_BANK: OnceLock<StyleBank> = OnceLock::new();

/// Install the process-wide bank. Fails with the rejected bank if one is
/// already installed.
pub fn install(bank: StyleBank) -> Result<&'static StyleBank, StyleBank> {
    STYLE_BANK.set(bank)?;
    Ok(global())
}

/// The installed bank, or the built-in tables if nothing was installed.
pub fn global() -> &'static StyleBank {
    STYLE_BANK.get_or_init(StyleBank::builtin)
}
