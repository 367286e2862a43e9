//! IQ sample demultiplexer
//!
//! Reassembles one antenna-switching CTE capture into the reference period
//! and a `[snapshot][antenna]` grid.
//!
//! ```text
//! I Q I Q ... (reference, antenna 0)  | I Q I Q ... (snapshot 0, antennas 0..n) | snapshot 1 ...
//! <----- 2 * reference_samples ----->   <------------ 2 * antennas ------------->
//! ```

use serde::{Deserialize, Serialize};

/// Raw samples are signed 8-bit values, normalized against this full-scale value
pub const SAMPLE_FULL_SCALE: f32 = 127.0;

/// Supported antenna array boards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArrayType {
    /// 4x4 uniform rectangular array
    #[default]
    Ura4x4,
    /// 3x3 uniform rectangular array, the center of a 4x4 board
    Ura3x3,
    /// 1x4 uniform linear array
    Ula1x4,
}

impl ArrayType {
    pub fn geometry(self) -> IqGeometry {
        match self {
            Self::Ura4x4 => IqGeometry::new(4, 16, 7),
            Self::Ura3x3 => IqGeometry::new(4, 9, 7),
            Self::Ula1x4 => IqGeometry::new(18, 4, 7),
        }
    }

    /// Antenna switching pattern as indices on a 4x4 element grid (row-major)
    pub fn switching_pattern(self) -> &'static [u8] {
        match self {
            Self::Ura4x4 => &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
            Self::Ura3x3 => &[1, 2, 3, 5, 6, 7, 9, 10, 11],
            Self::Ula1x4 => &[0, 1, 2, 3],
        }
    }

    pub fn is_linear(self) -> bool {
        matches!(self, Self::Ula1x4)
    }
}

/// Fixed capture geometry of one array type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IqGeometry {
    /// How many times the antennas are scanned during one packet
    pub snapshots: usize,
    pub antennas: usize,
    /// IQ pairs sampled on antenna 0 before switching starts
    pub reference_samples: usize,
}

impl IqGeometry {
    pub const fn new(snapshots: usize, antennas: usize, reference_samples: usize) -> Self {
        Self {
            snapshots,
            antennas,
            reference_samples,
        }
    }

    /// Number of raw `i8` values needed to fill every cell
    pub fn required_samples(&self) -> usize {
        2 * (self.reference_samples + self.snapshots * self.antennas)
    }
}

/// How much of the geometry one capture filled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemuxOutcome {
    pub consumed: usize,
    pub required: usize,
}

impl DemuxOutcome {
    pub fn is_complete(&self) -> bool {
        self.consumed >= self.required
    }
}

/// Destination buffers for one capture
///
/// Cells a short capture cannot reach are reset to `0.0` on every call, so no
/// value from an earlier packet survives into the next estimation.
#[derive(Debug, Clone)]
pub struct IqBuffers {
    geometry: IqGeometry,
    ref_i: Vec<f32>,
    ref_q: Vec<f32>,
    ant_i: Vec<Vec<f32>>,
    ant_q: Vec<Vec<f32>>,
}

impl IqBuffers {
    pub fn new(geometry: IqGeometry) -> Self {
        Self {
            geometry,
            ref_i: vec![0.0; geometry.reference_samples],
            ref_q: vec![0.0; geometry.reference_samples],
            ant_i: vec![vec![0.0; geometry.antennas]; geometry.snapshots],
            ant_q: vec![vec![0.0; geometry.antennas]; geometry.snapshots],
        }
    }

    pub fn geometry(&self) -> IqGeometry {
        self.geometry
    }

    /// Fill the buffers from a flat `I, Q, I, Q, ...` capture
    ///
    /// Values beyond the geometry are ignored. The input is never read past its end.
    pub fn demultiplex(&mut self, samples: &[i8]) -> DemuxOutcome {
        self.clear();

        let required = self.geometry.required_samples();
        let mut values = samples
            .iter()
            .take(required)
            .map(|&raw| raw as f32 / SAMPLE_FULL_SCALE);

        'fill: {
            for k in 0..self.geometry.reference_samples {
                let Some(i) = values.next() else { break 'fill };
                self.ref_i[k] = i;
                let Some(q) = values.next() else { break 'fill };
                self.ref_q[k] = q;
            }
            for snapshot in 0..self.geometry.snapshots {
                for antenna in 0..self.geometry.antennas {
                    let Some(i) = values.next() else { break 'fill };
                    self.ant_i[snapshot][antenna] = i;
                    let Some(q) = values.next() else { break 'fill };
                    self.ant_q[snapshot][antenna] = q;
                }
            }
        }

        DemuxOutcome {
            consumed: samples.len().min(required),
            required,
        }
    }

    fn clear(&mut self) {
        self.ref_i.fill(0.0);
        self.ref_q.fill(0.0);
        for row in self.ant_i.iter_mut().chain(self.ant_q.iter_mut()) {
            row.fill(0.0);
        }
    }

    pub fn reference_i(&self) -> &[f32] {
        &self.ref_i
    }

    pub fn reference_q(&self) -> &[f32] {
        &self.ref_q
    }

    /// In-phase grid, `[snapshot][antenna]`
    pub fn antenna_i(&self) -> &[Vec<f32>] {
        &self.ant_i
    }

    /// Quadrature grid, `[snapshot][antenna]`
    pub fn antenna_q(&self) -> &[Vec<f32>] {
        &self.ant_q
    }
}
