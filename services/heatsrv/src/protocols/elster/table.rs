//! Well-known Elster parameters
//!
//! Sorted by index so lookups can binary search.

use serde::Serialize;
use std::borrow::Cow;

use super::value::ElsterValueType;
use super::value::ElsterValueType as T;

/// One entry of the parameter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ElsterParameter {
    pub index: u16,
    pub name: &'static str,
    pub value_type: ElsterValueType,
}

const fn param(index: u16, name: &'static str, value_type: ElsterValueType) -> ElsterParameter {
    ElsterParameter {
        index,
        name,
        value_type,
    }
}

static PARAMETERS: &[ElsterParameter] = &[
    param(0x0001, "FEHLERMELDUNG", T::ErrNr),
    param(0x0002, "KESSELSOLLTEMP", T::DecVal),
    param(0x0003, "SPEICHERSOLLTEMP", T::DecVal),
    param(0x0004, "VORLAUFSOLLTEMP", T::DecVal),
    param(0x0005, "RAUMSOLLTEMP_I", T::DecVal),
    param(0x0006, "RAUMSOLLTEMP_II", T::DecVal),
    param(0x0007, "RAUMSOLLTEMP_III", T::DecVal),
    param(0x0008, "RAUMSOLLTEMP_NACHT", T::DecVal),
    param(0x0009, "UHRZEIT", T::Time),
    param(0x000a, "DATUM", T::Date),
    param(0x000b, "GERAETE_ID", T::DevId),
    param(0x000c, "AUSSENTEMP", T::DecVal),
    param(0x000d, "SAMMLERISTTEMP", T::DecVal),
    param(0x000e, "SPEICHERISTTEMP", T::DecVal),
    param(0x000f, "VORLAUFISTTEMP", T::DecVal),
    param(0x0010, "GERAETEKONFIGURATION", T::Default),
    param(0x0011, "RAUMISTTEMP", T::DecVal),
    param(0x0012, "VERSTELLTE_RAUMSOLLTEMP", T::DecVal),
    param(0x0013, "EINSTELL_SPEICHERSOLLTEMP", T::DecVal),
    param(0x0014, "VERDAMPFERTEMP", T::DecVal),
    param(0x0015, "SAMMLERSOLLTEMP", T::DecVal),
    param(0x0016, "RUECKLAUFISTTEMP", T::DecVal),
    param(0x0017, "SPEICHER_UNTEN_TEMP", T::DecVal),
    param(0x0018, "SOLARZONENTEMP", T::DecVal),
    param(0x0019, "SPEICHER_OBEN_TEMP", T::DecVal),
    param(0x001a, "KOLLEKTORTEMP", T::DecVal),
    param(0x001b, "FESTSTOFFKESSELTEMP", T::DecVal),
    param(0x001c, "MIN_TEMP_KESSEL", T::DecVal),
    param(0x001d, "ANFAHRTEMP", T::DecVal),
    param(0x001e, "HYSTERESEZEIT", T::DecVal),
    param(0x001f, "MAX_HYSTERESE", T::DecVal),
    param(0x0020, "PPL_BEGRENZUNG", T::DecVal),
    param(0x0028, "MAX_VORLAUFTEMP", T::DecVal),
    param(0x0112, "PROGRAMMSCHALTER", T::OperatingMode),
    param(0x0121, "WOCHENTAG", T::LittleEndian),
    param(0x0122, "TAG", T::LittleEndian),
    param(0x0123, "MONAT", T::LittleEndian),
    param(0x0124, "JAHR", T::LittleEndian),
    param(0x0125, "STUNDE", T::LittleEndian),
    param(0x0126, "MINUTE", T::LittleEndian),
    param(0x0127, "SEKUNDE", T::LittleEndian),
    param(0x0199, "SOFTWARE_NUMMER", T::Default),
    param(0x019a, "SOFTWARE_VERSION", T::Default),
];

/// Look up a parameter by index
pub fn lookup(index: u16) -> Option<&'static ElsterParameter> {
    PARAMETERS
        .binary_search_by_key(&index, |p| p.index)
        .ok()
        .map(|pos| &PARAMETERS[pos])
}

/// Look up a parameter by its table name (case-insensitive)
pub fn find_by_name(name: &str) -> Option<&'static ElsterParameter> {
    PARAMETERS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Table name, or `ELSTER_0xNNNN` for unknown indices
pub fn parameter_name(index: u16) -> Cow<'static, str> {
    match lookup(index) {
        Some(param) => Cow::Borrowed(param.name),
        None => Cow::Owned(format!("ELSTER_0x{:04x}", index)),
    }
}

/// All known parameters in index order
pub fn parameters() -> &'static [ElsterParameter] {
    PARAMETERS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_sorted_and_unique() {
        assert!(PARAMETERS.windows(2).all(|w| w[0].index < w[1].index));
    }

    #[test]
    fn test_lookup() {
        let param = lookup(0x000c).unwrap();
        assert_eq!(param.name, "AUSSENTEMP");
        assert_eq!(param.value_type, ElsterValueType::DecVal);
        assert_eq!(lookup(0x0112).unwrap().value_type, ElsterValueType::OperatingMode);
        assert!(lookup(0x4242).is_none());
    }

    #[test]
    fn test_names() {
        assert_eq!(parameter_name(0x000b), "GERAETE_ID");
        assert_eq!(parameter_name(0x4242), "ELSTER_0x4242");
        assert_eq!(find_by_name("speicheristtemp").map(|p| p.index), Some(0x000e));
        assert!(find_by_name("NOPE").is_none());
    }
}
