//! Logical AFLOW properties and their AFLUX encoding.
//!
//! The registry is built once on first use and is read-only afterwards, so
//! it can be shared by any number of concurrent queries without locking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use serde::Serialize;

use crate::error::{AflowError, Result};

/// Kind of value a property carries once materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValueKind {
    Number,
    String,
    Boolean,
    List,
    Unknown,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Boolean => "boolean",
            ValueKind::List => "list",
            ValueKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PropertyDescriptor {
    /// Name used by callers.
    pub name: &'static str,
    /// AFLUX keyword.
    pub remote_key: &'static str,
    pub value_kind: ValueKind,
    /// Element kind for `List` properties.
    pub item_kind: Option<ValueKind>,
}

impl PropertyDescriptor {
    /// Kind a filter literal must have to be compared against this property.
    pub fn literal_kind(&self) -> ValueKind {
        match self.value_kind {
            ValueKind::List => self.item_kind.unwrap_or(ValueKind::Unknown),
            kind => kind,
        }
    }
}

/// Unique identifier used to break ordering ties.
pub const FALLBACK_KEY: &str = "auid";

const fn scalar(name: &'static str, remote_key: &'static str, kind: ValueKind) -> PropertyDescriptor {
    PropertyDescriptor {
        name,
        remote_key,
        value_kind: kind,
        item_kind: None,
    }
}

const fn list(name: &'static str, remote_key: &'static str, item: ValueKind) -> PropertyDescriptor {
    PropertyDescriptor {
        name,
        remote_key,
        value_kind: ValueKind::List,
        item_kind: Some(item),
    }
}

static PROPERTIES: &[PropertyDescriptor] = &[
    // identity
    scalar("auid", "auid", ValueKind::String),
    scalar("aurl", "aurl", ValueKind::String),
    scalar("compound", "compound", ValueKind::String),
    scalar("prototype", "prototype", ValueKind::String),
    scalar("catalog", "catalog", ValueKind::String),
    // composition
    list("species", "species", ValueKind::String),
    list("composition", "composition", ValueKind::Number),
    list("stoichiometry", "stoichiometry", ValueKind::Number),
    scalar("nspecies", "nspecies", ValueKind::Number),
    scalar("natoms", "natoms", ValueKind::Number),
    // structure
    scalar("density", "density", ValueKind::Number),
    scalar("volume", "volume_cell", ValueKind::Number),
    scalar("volume_atom", "volume_atom", ValueKind::Number),
    scalar("space_group", "spacegroup_relax", ValueKind::Number),
    scalar("bravais_lattice", "Bravais_lattice_relax", ValueKind::String),
    list("lattice_parameters", "geometry", ValueKind::Number),
    // electronic
    scalar("band_gap", "Egap", ValueKind::Number),
    scalar("band_gap_type", "Egap_type", ValueKind::String),
    scalar("energy_atom", "energy_atom", ValueKind::Number),
    scalar("formation_enthalpy", "enthalpy_formation_atom", ValueKind::Number),
    scalar("spin_atom", "spin_atom", ValueKind::Number),
    scalar("is_metal", "is_metal", ValueKind::Boolean),
    // calculation
    scalar("dft_type", "dft_type", ValueKind::String),
    list("loop", "loop", ValueKind::String),
    scalar("kpoints", "kpoints", ValueKind::Unknown),
];

/// AFLUX keywords with no logical property above. They can be named in raw
/// matchbooks and come back untyped.
static UNTYPED_KEYWORDS: &[&str] = &[
    "Bravais_lattice_orig",
    "Bravais_superlattice_orig",
    "Bravais_superlattice_relax",
    "Egap_fit",
    "Egap_fit_type",
    "PV_atom",
    "PV_cell",
    "Pearson_symbol_orig",
    "Pearson_symbol_relax",
    "Pulay_stress",
    "ael_bulk_modulus_reuss",
    "ael_bulk_modulus_voigt",
    "ael_bulk_modulus_vrh",
    "ael_debye_temperature",
    "ael_elastic_anisotropy",
    "ael_poisson_ratio",
    "ael_shear_modulus_reuss",
    "ael_shear_modulus_voigt",
    "ael_shear_modulus_vrh",
    "aflow_prototype_label_relax",
    "aflowlib_version",
    "agl_acoustic_debye",
    "agl_bulk_modulus_isothermal_300K",
    "agl_bulk_modulus_static_300K",
    "agl_debye",
    "agl_gruneisen",
    "agl_heat_capacity_Cp_300K",
    "agl_heat_capacity_Cv_300K",
    "agl_thermal_conductivity_300K",
    "agl_thermal_expansion_300K",
    "author",
    "calculation_cores",
    "calculation_memory",
    "calculation_time",
    "code",
    "data_source",
    "eentropy_atom",
    "eentropy_cell",
    "energy_cell",
    "energy_cutoff",
    "enthalpy_atom",
    "enthalpy_cell",
    "enthalpy_formation_cell",
    "entropic_temperature",
    "files",
    "forces",
    "kpoints_bands_path",
    "kpoints_relax",
    "kpoints_static",
    "lattice_system_orig",
    "lattice_system_relax",
    "ldau_TLUJ",
    "ldau_type",
    "natoms_orig",
    "positions_cartesian",
    "positions_fractional",
    "pressure",
    "pressure_residual",
    "sg",
    "sg2",
    "spacegroup_orig",
    "species_pp",
    "species_pp_ZVAL",
    "species_pp_version",
    "spin_cell",
    "spinD",
    "stress_tensor",
    "valence_cell_iupac",
    "valence_cell_std",
];

struct Registry {
    by_name: BTreeMap<&'static str, &'static PropertyDescriptor>,
    /// Every AFLUX keyword, named by the keyword itself.
    by_key: BTreeMap<&'static str, PropertyDescriptor>,
}

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let mut by_key = PROPERTIES
        .iter()
        .map(|p| {
            let descriptor = PropertyDescriptor {
                name: p.remote_key,
                ..p.clone()
            };
            (p.remote_key, descriptor)
        })
        .collect::<BTreeMap<_, _>>();
    for &key in UNTYPED_KEYWORDS {
        by_key
            .entry(key)
            .or_insert_with(|| scalar(key, key, ValueKind::Unknown));
    }
    Registry {
        by_name: PROPERTIES.iter().map(|p| (p.name, p)).collect(),
        by_key,
    }
});

/// Looks up a property by its logical name.
pub fn resolve(name: &str) -> Result<&'static PropertyDescriptor> {
    REGISTRY
        .by_name
        .get(name)
        .copied()
        .ok_or_else(|| AflowError::UnknownProperty(name.to_string()))
}

/// Looks up an AFLUX keyword. The descriptor is named after the keyword, and
/// keywords without a logical property carry [`ValueKind::Unknown`].
pub fn keyword(key: &str) -> Result<&'static PropertyDescriptor> {
    REGISTRY
        .by_key
        .get(key)
        .ok_or_else(|| AflowError::UnknownProperty(key.to_string()))
}

/// All known properties, sorted by logical name.
pub fn properties() -> impl Iterator<Item = &'static PropertyDescriptor> {
    REGISTRY.by_name.values().copied()
}

pub(crate) fn fallback() -> &'static PropertyDescriptor {
    &PROPERTIES[0]
}
