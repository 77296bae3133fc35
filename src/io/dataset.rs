//! Hierarchical molecule dataset, JSON on disk.
//!
//! One file holds many molecules keyed by identifier. Each record carries
//! the grid, integrals, orbital data and the omega-indexed chi kernel the
//! external engine precomputed. Loading can select a subset of the stored
//! omega channels by exact value; asking for an omega that was never
//! precomputed is a configuration error, never silently zeros.

extern crate nalgebra as na;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use na::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::molecule::{ChiTensor, EriTensor, Grid, Molecule, SpinMatrix};

#[derive(Debug, Serialize, Deserialize)]
struct DatasetFile {
    molecules: BTreeMap<String, MoleculeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MoleculeRecord {
    coords: Vec<[f64; 3]>,
    weights: Vec<f64>,
    ao: DMatrix<f64>,
    grad_ao: [DMatrix<f64>; 3],
    /// One matrix for a restricted (closed-shell) density, two for a
    /// spin-resolved pair. Anything else is malformed.
    rdm1: Vec<DMatrix<f64>>,
    h1e: DMatrix<f64>,
    s1e: DMatrix<f64>,
    rep_tensor: Option<Vec<f64>>,
    mo_coeff: Vec<DMatrix<f64>>,
    mo_energy: Vec<Vec<f64>>,
    mo_occ: Vec<Vec<f64>>,
    energy_nuc: f64,
    energy: Option<f64>,
    omegas: Vec<f64>,
    /// Flat `(n_grid, n_omegas, 2, n_ao)` kernel, if precomputed.
    chi: Option<Vec<f64>>,
    nuclear_pos: Vec<[f64; 3]>,
    atom_index: Vec<u32>,
    basis: String,
    spin: i32,
    charge: i32,
}

/// Load every molecule in the file, selecting omega channels.
///
/// `requested_omegas`: `None` keeps everything stored; an empty slice drops
/// the chi tensor; otherwise each requested value must match a stored omega
/// exactly and the chi channels are reordered to the request.
pub fn load_dataset(
    path: impl AsRef<Path>,
    requested_omegas: Option<&[f64]>,
) -> Result<Vec<(String, Molecule)>> {
    let text = fs::read_to_string(path.as_ref())?;
    let file: DatasetFile = serde_json::from_str(&text)?;
    let mut out = Vec::with_capacity(file.molecules.len());
    for (name, record) in file.molecules {
        let molecule = molecule_from_record(&name, record, requested_omegas)?;
        out.push((name, molecule));
    }
    info!(
        count = out.len(),
        path = %path.as_ref().display(),
        "dataset loaded"
    );
    Ok(out)
}

/// Write molecules back out in the same layout `load_dataset` reads.
/// Densities are always saved spin-resolved.
pub fn save_dataset(path: impl AsRef<Path>, molecules: &[(String, Molecule)]) -> Result<()> {
    let mut records = BTreeMap::new();
    for (name, m) in molecules {
        records.insert(name.clone(), record_from_molecule(m));
    }
    let file = DatasetFile { molecules: records };
    fs::write(path, serde_json::to_string(&file)?)?;
    Ok(())
}

fn molecule_from_record(
    name: &str,
    record: MoleculeRecord,
    requested_omegas: Option<&[f64]>,
) -> Result<Molecule> {
    let n_grid = record.coords.len();
    let n_ao = record.h1e.nrows();

    // Restricted input carries a single total density; split it into two
    // identical half densities with halved occupations, the closed-shell
    // convention of the upstream engine.
    let (rdm1, mo_coeff, mo_energy, mo_occ) = match record.rdm1.len() {
        1 => {
            if record.mo_coeff.len() != 1
                || record.mo_energy.len() != 1
                || record.mo_occ.len() != 1
            {
                return Err(Error::config(format!(
                    "molecule '{name}': restricted density but spin-resolved orbitals"
                )));
            }
            let rdm1 = SpinMatrix::from_restricted(&record.rdm1[0]);
            let coeff = SpinMatrix::new(record.mo_coeff[0].clone(), record.mo_coeff[0].clone());
            let energy = DVector::from_vec(record.mo_energy[0].clone());
            let occ = DVector::from_vec(record.mo_occ[0].clone()).scale(0.5);
            (rdm1, coeff, [energy.clone(), energy], [occ.clone(), occ])
        }
        2 => {
            if record.mo_coeff.len() != 2
                || record.mo_energy.len() != 2
                || record.mo_occ.len() != 2
            {
                return Err(Error::config(format!(
                    "molecule '{name}': spin-resolved density but mismatched orbital data"
                )));
            }
            (
                SpinMatrix::new(record.rdm1[0].clone(), record.rdm1[1].clone()),
                SpinMatrix::new(record.mo_coeff[0].clone(), record.mo_coeff[1].clone()),
                [
                    DVector::from_vec(record.mo_energy[0].clone()),
                    DVector::from_vec(record.mo_energy[1].clone()),
                ],
                [
                    DVector::from_vec(record.mo_occ[0].clone()),
                    DVector::from_vec(record.mo_occ[1].clone()),
                ],
            )
        }
        rank => {
            return Err(Error::config(format!(
                "molecule '{name}': density matrix must have 1 or 2 spin slices, found {rank}"
            )))
        }
    };

    let stored_chi = match record.chi {
        Some(data) => Some(ChiTensor::new(n_grid, record.omegas.len(), n_ao, data)?),
        None => None,
    };

    // Omega channel selection by exact value match.
    let (omegas, chi) = match requested_omegas {
        None => (record.omegas.clone(), stored_chi),
        Some([]) => (Vec::new(), None),
        Some(wanted) => {
            let chi = stored_chi.ok_or_else(|| {
                Error::config(format!(
                    "molecule '{name}': omegas {wanted:?} requested but no chi tensor is stored"
                ))
            })?;
            let indices = wanted
                .iter()
                .map(|w| {
                    record.omegas.iter().position(|s| s == w).ok_or_else(|| {
                        Error::config(format!(
                            "molecule '{name}': omega {w} not precomputed (stored: {:?})",
                            record.omegas
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            (wanted.to_vec(), Some(chi.select(&indices)))
        }
    };

    let coords = record
        .coords
        .iter()
        .map(|c| Vector3::new(c[0], c[1], c[2]))
        .collect();
    let rep_tensor = match record.rep_tensor {
        Some(data) => Some(EriTensor::new(n_ao, data)?),
        None => None,
    };

    Molecule {
        grid: Grid::new(coords, DVector::from_vec(record.weights))?,
        ao: record.ao,
        grad_ao: record.grad_ao,
        rdm1,
        h1e: record.h1e,
        s1e: record.s1e,
        rep_tensor,
        mo_coeff,
        mo_energy,
        mo_occ,
        energy_nuc: record.energy_nuc,
        reference_energy: record.energy,
        omegas,
        chi,
        nuclear_pos: record
            .nuclear_pos
            .iter()
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect(),
        atom_index: record.atom_index,
        basis: record.basis,
        spin: record.spin,
        charge: record.charge,
    }
    .validated()
}

fn record_from_molecule(m: &Molecule) -> MoleculeRecord {
    MoleculeRecord {
        coords: m.grid.coords.iter().map(|c| [c.x, c.y, c.z]).collect(),
        weights: m.grid.weights.iter().cloned().collect(),
        ao: m.ao.clone(),
        grad_ao: m.grad_ao.clone(),
        rdm1: vec![m.rdm1.alpha.clone(), m.rdm1.beta.clone()],
        h1e: m.h1e.clone(),
        s1e: m.s1e.clone(),
        rep_tensor: m.rep_tensor.as_ref().map(|t| t.data().to_vec()),
        mo_coeff: vec![m.mo_coeff.alpha.clone(), m.mo_coeff.beta.clone()],
        mo_energy: m.mo_energy.iter().map(|v| v.iter().cloned().collect()).collect(),
        mo_occ: m.mo_occ.iter().map(|v| v.iter().cloned().collect()).collect(),
        energy_nuc: m.energy_nuc,
        energy: m.reference_energy,
        omegas: m.omegas.clone(),
        chi: m.chi.as_ref().map(|c| c.data().to_vec()),
        nuclear_pos: m.nuclear_pos.iter().map(|c| [c.x, c.y, c.z]).collect(),
        atom_index: m.atom_index.clone(),
        basis: m.basis.clone(),
        spin: m.spin,
        charge: m.charge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::h2_like;
    use approx::assert_relative_eq;
    use std::path::PathBuf;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mlscf-{}-{}.json", tag, std::process::id()))
    }

    #[test]
    fn round_trip_preserves_the_snapshot() {
        let mol = h2_like();
        let path = temp_path("roundtrip");
        save_dataset(&path, &[("h2".to_string(), mol.clone())]).unwrap();
        let loaded = load_dataset(&path, None).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.len(), 1);
        let (name, back) = &loaded[0];
        assert_eq!(name, "h2");
        assert_relative_eq!(back.rdm1.max_abs_diff(&mol.rdm1), 0.0);
        assert_eq!(back.omegas, mol.omegas);
        assert_eq!(back.basis, mol.basis);
        assert_relative_eq!(back.energy_nuc, mol.energy_nuc);
        assert!(back.chi.is_some() && back.rep_tensor.is_some());
    }

    #[test]
    fn omega_subset_selection_reorders_channels() {
        let mol = h2_like();
        let path = temp_path("subset");
        save_dataset(&path, &[("h2".to_string(), mol.clone())]).unwrap();
        let loaded = load_dataset(&path, Some(&[0.4])).unwrap();
        std::fs::remove_file(&path).ok();

        let (_, back) = &loaded[0];
        assert_eq!(back.omegas, vec![0.4]);
        let chi = back.chi.as_ref().unwrap();
        assert_eq!(chi.n_omegas, 1);
        // Stored omega 0.4 was channel 1.
        let original = mol.chi.as_ref().unwrap();
        assert_relative_eq!(chi.at(0, 0, 0, 0), original.at(0, 1, 0, 0));
    }

    #[test]
    fn missing_omega_is_a_config_error() {
        let mol = h2_like();
        let path = temp_path("missing-omega");
        save_dataset(&path, &[("h2".to_string(), mol)]).unwrap();
        let r = load_dataset(&path, Some(&[0.7]));
        std::fs::remove_file(&path).ok();
        assert!(matches!(r, Err(Error::Config(_))));
    }

    #[test]
    fn empty_omega_request_drops_chi() {
        let mol = h2_like();
        let path = temp_path("no-omega");
        save_dataset(&path, &[("h2".to_string(), mol)]).unwrap();
        let loaded = load_dataset(&path, Some(&[])).unwrap();
        std::fs::remove_file(&path).ok();
        let (_, back) = &loaded[0];
        assert!(back.chi.is_none());
        assert!(back.omegas.is_empty());
    }

    #[test]
    fn restricted_input_splits_into_half_densities() {
        let mol = h2_like();
        let path = temp_path("restricted");
        // Save spin-resolved, then rewrite the record to a restricted one.
        save_dataset(&path, &[("h2".to_string(), mol.clone())]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut file: DatasetFile = serde_json::from_str(&text).unwrap();
        {
            let rec = file.molecules.get_mut("h2").unwrap();
            let total = &rec.rdm1[0] + &rec.rdm1[1];
            rec.rdm1 = vec![total];
            rec.mo_coeff.truncate(1);
            rec.mo_energy.truncate(1);
            let doubled: Vec<f64> = rec.mo_occ[0].iter().map(|o| o * 2.0).collect();
            rec.mo_occ = vec![doubled];
        }
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        let loaded = load_dataset(&path, None).unwrap();
        std::fs::remove_file(&path).ok();
        let (_, back) = &loaded[0];
        assert_relative_eq!(back.rdm1.max_abs_diff(&mol.rdm1), 0.0, epsilon = 1e-12);
        assert_relative_eq!(back.mo_occ[0].sum(), 1.0);
    }

    #[test]
    fn malformed_spin_rank_is_rejected() {
        let mol = h2_like();
        let path = temp_path("bad-rank");
        save_dataset(&path, &[("h2".to_string(), mol)]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut file: DatasetFile = serde_json::from_str(&text).unwrap();
        {
            let rec = file.molecules.get_mut("h2").unwrap();
            let extra = rec.rdm1[0].clone();
            rec.rdm1.push(extra);
        }
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();
        let r = load_dataset(&path, None);
        std::fs::remove_file(&path).ok();
        assert!(matches!(r, Err(Error::Config(_))));
    }
}
