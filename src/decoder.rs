// sph - Decoder (per-column softmax predictor of the next input)
#![allow(clippy::needless_range_loop)]

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::helpers::*;

#[derive(Clone, Debug)]
pub struct VisibleLayerDesc {
    pub size: Int3,
    pub radius: i32,
}

impl Default for VisibleLayerDesc {
    fn default() -> Self {
        Self {
            size: Int3::new(4, 4, 16),
            radius: 2,
        }
    }
}

/// Per-input state of the decoder. `input_cis_prev` holds the inputs seen at
/// the previous step's forward pass; learning always runs against those, so
/// the decoder is trained to predict one step ahead. `gates` is the
/// per-visible-column damping recomputed before every learn pass.
#[derive(Clone, Debug, Default)]
pub struct VisibleLayer {
    pub weights: ByteBuffer,
    pub input_cis_prev: IntBuffer,
    pub gates: FloatBuffer,
}

#[derive(Clone, Debug)]
pub struct Params {
    /// Softmax temperature of the prediction.
    pub scale: f32,
    /// Byte-weight learning rate.
    pub lr: f32,
    /// Gate falloff on prediction error.
    pub gcurve: f32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            scale: 64.0,
            lr: 0.05,
            gcurve: 16.0,
        }
    }
}

// Result of one column's forward pass
struct ForwardResult {
    hidden_ci: i32,
    hidden_sums: Vec<i32>,
    hidden_acts: Vec<f32>,
}

/// Predicts one categorical output column grid from the hidden codes it is
/// wired to. Cross-entropy deltas against the previous forward's softmax are
/// applied to saturating byte weights, addressed by the inputs captured at
/// that previous forward.
#[derive(Clone, Debug, Default)]
pub struct Decoder {
    hidden_size: Int3,
    hidden_cis: IntBuffer,
    hidden_sums: IntBuffer,
    hidden_acts: FloatBuffer,
    hidden_deltas: FloatBuffer,
    pub visible_layers: Vec<VisibleLayer>,
    pub visible_layer_descs: Vec<VisibleLayerDesc>,
}

impl Decoder {
    pub fn new(hidden_size: Int3, visible_layer_descs: Vec<VisibleLayerDesc>, rng: &mut Rng) -> Result<Self> {
        if hidden_size.x <= 0 || hidden_size.y <= 0 || hidden_size.z <= 0 {
            return Err(Error::Configuration(format!(
                "decoder hidden size has a zero or negative dimension: {hidden_size:?}"
            )));
        }
        if visible_layer_descs.is_empty() {
            return Err(Error::Configuration("decoder has no visible layers".into()));
        }

        for vld in &visible_layer_descs {
            if vld.size.x <= 0 || vld.size.y <= 0 || vld.size.z <= 0 {
                return Err(Error::Configuration(format!(
                    "decoder visible layer has a zero or negative dimension: {:?}",
                    vld.size
                )));
            }
            if vld.radius < 0 {
                return Err(Error::Configuration(format!(
                    "decoder visible layer radius is negative: {}",
                    vld.radius
                )));
            }
        }

        let num_hidden_columns = hidden_size.num_columns();
        let num_hidden_cells = hidden_size.num_cells();

        // byte weights start near the midpoint so early deltas can move
        // either direction without saturating
        let half = 255u32 / 2;

        let visible_layers = visible_layer_descs
            .iter()
            .map(|vld| {
                let diam = vld.radius * 2 + 1;
                let area = (diam * diam) as usize;
                let weights_size = num_hidden_cells * area * vld.size.z as usize;
                let num_visible_columns = vld.size.num_columns();

                let weights: ByteBuffer = (0..weights_size)
                    .map(|_| {
                        (half - INIT_WEIGHT_NOISEI / 2 + rng.next_below(INIT_WEIGHT_NOISEI + 1))
                            as u8
                    })
                    .collect();

                VisibleLayer {
                    weights,
                    input_cis_prev: vec![0i32; num_visible_columns],
                    gates: vec![0.0f32; num_visible_columns],
                }
            })
            .collect();

        Ok(Self {
            hidden_size,
            hidden_cis: vec![0i32; num_hidden_columns],
            hidden_sums: vec![0i32; num_hidden_cells],
            hidden_acts: vec![0.0f32; num_hidden_cells],
            hidden_deltas: vec![0.0f32; num_hidden_cells],
            visible_layers,
            visible_layer_descs,
        })
    }

    fn forward_column(
        column_pos: Int2,
        hidden_size: Int3,
        visible_layers: &[VisibleLayer],
        visible_layer_descs: &[VisibleLayerDesc],
        input_cis: &[&[i32]],
        params: &Params,
    ) -> ForwardResult {
        let hidden_column_index = address2(column_pos, Int2::new(hidden_size.x, hidden_size.y));
        let num_hc = hidden_size.z as usize;

        let mut sums = vec![0i32; num_hc];
        let mut count = 0usize;

        for vli in 0..visible_layers.len() {
            let vl = &visible_layers[vli];
            let vld = &visible_layer_descs[vli];

            let diam = vld.radius * 2 + 1;
            let h_to_v = Float2::new(
                vld.size.x as f32 / hidden_size.x as f32,
                vld.size.y as f32 / hidden_size.y as f32,
            );
            let visible_center = project(column_pos, h_to_v);
            let field_lower_bound = Int2::new(
                visible_center.x - vld.radius,
                visible_center.y - vld.radius,
            );
            let iter_lower_bound =
                Int2::new(field_lower_bound.x.max(0), field_lower_bound.y.max(0));
            let iter_upper_bound = Int2::new(
                (visible_center.x + vld.radius).min(vld.size.x - 1),
                (visible_center.y + vld.radius).min(vld.size.y - 1),
            );

            count += ((iter_upper_bound.x - iter_lower_bound.x + 1)
                * (iter_upper_bound.y - iter_lower_bound.y + 1)) as usize;

            let vl_input_cis = input_cis[vli];

            for ix in iter_lower_bound.x..=iter_upper_bound.x {
                for iy in iter_lower_bound.y..=iter_upper_bound.y {
                    let visible_column_index =
                        address2(Int2::new(ix, iy), Int2::new(vld.size.x, vld.size.y));
                    let in_ci = vl_input_cis[visible_column_index] as usize;
                    let offset = Int2::new(ix - field_lower_bound.x, iy - field_lower_bound.y);

                    let wi_start = num_hc
                        * (offset.y as usize
                            + diam as usize
                                * (offset.x as usize
                                    + diam as usize
                                        * (in_ci + vld.size.z as usize * hidden_column_index)));

                    for hc in 0..num_hc {
                        sums[hc] += vl.weights[hc + wi_start] as i32;
                    }
                }
            }
        }

        let norm = 1.0 / (255.0 * count.max(1) as f32);

        let mut acts = vec![0.0f32; num_hc];

        let mut max_index = 0usize;
        let mut max_activation = f32::NEG_INFINITY;

        for hc in 0..num_hc {
            let act = sums[hc] as f32 * norm;
            acts[hc] = act;

            if act > max_activation {
                max_activation = act;
                max_index = hc;
            }
        }

        let mut total = 0.0f32;
        for hc in 0..num_hc {
            acts[hc] = (params.scale * (acts[hc] - max_activation)).exp();
            total += acts[hc];
        }
        let total_inv = 1.0 / LIMIT_SMALL.max(total);
        for hc in 0..num_hc {
            acts[hc] *= total_inv;
        }

        ForwardResult {
            hidden_ci: max_index as i32,
            hidden_sums: sums,
            hidden_acts: acts,
        }
    }

    // Gate for one visible column: the mean squared prediction delta over
    // the output columns whose patches cover it, pushed through the falloff.
    fn update_gates_column(
        column_pos: Int2,
        hidden_size: Int3,
        vld: &VisibleLayerDesc,
        hidden_deltas: &[f32],
        params: &Params,
    ) -> f32 {
        let num_hc = hidden_size.z as usize;
        let diam = vld.radius * 2 + 1;

        let v_to_h = Float2::new(
            hidden_size.x as f32 / vld.size.x as f32,
            hidden_size.y as f32 / vld.size.y as f32,
        );
        let h_to_v = Float2::new(
            vld.size.x as f32 / hidden_size.x as f32,
            vld.size.y as f32 / hidden_size.y as f32,
        );

        let reverse_radii = Int2::new(
            (v_to_h.x * diam as f32 * 0.5).ceil() as i32,
            (v_to_h.y * diam as f32 * 0.5).ceil() as i32,
        );

        let hidden_center = project(column_pos, v_to_h);
        let iter_lower_bound = Int2::new(
            (hidden_center.x - reverse_radii.x).max(0),
            (hidden_center.y - reverse_radii.y).max(0),
        );
        let iter_upper_bound = Int2::new(
            (hidden_center.x + reverse_radii.x).min(hidden_size.x - 1),
            (hidden_center.y + reverse_radii.y).min(hidden_size.y - 1),
        );

        let mut sq_error = 0.0f32;
        let mut count = 0usize;

        for ix in iter_lower_bound.x..=iter_upper_bound.x {
            for iy in iter_lower_bound.y..=iter_upper_bound.y {
                let hidden_pos = Int2::new(ix, iy);
                let hidden_column_index =
                    address2(hidden_pos, Int2::new(hidden_size.x, hidden_size.y));
                let visible_center = project(hidden_pos, h_to_v);

                if in_bounds(
                    column_pos,
                    Int2::new(visible_center.x - vld.radius, visible_center.y - vld.radius),
                    Int2::new(
                        visible_center.x + vld.radius + 1,
                        visible_center.y + vld.radius + 1,
                    ),
                ) {
                    let hidden_cells_start = hidden_column_index * num_hc;

                    for hc in 0..num_hc {
                        let delta = hidden_deltas[hc + hidden_cells_start];
                        sq_error += delta * delta;
                    }

                    count += 1;
                }
            }
        }

        // mean squared delta keeps the gate scale independent of column depth
        (-params.gcurve * sq_error / (count.max(1) * num_hc) as f32).exp()
    }

    // Gated saturating byte update for one output column's weight slab of
    // one visible layer, addressed by that layer's previous inputs.
    #[allow(clippy::too_many_arguments)]
    fn learn_column(
        column_pos: Int2,
        hidden_size: Int3,
        vld: &VisibleLayerDesc,
        slab: &mut [u8],
        input_cis_prev: &[i32],
        gates: &[f32],
        hidden_deltas: &[f32],
        rng: &mut Rng,
        params: &Params,
    ) {
        let hidden_column_index = address2(column_pos, Int2::new(hidden_size.x, hidden_size.y));
        let hidden_cells_start = hidden_column_index * hidden_size.z as usize;
        let num_hc = hidden_size.z as usize;
        let diam = vld.radius * 2 + 1;

        let h_to_v = Float2::new(
            vld.size.x as f32 / hidden_size.x as f32,
            vld.size.y as f32 / hidden_size.y as f32,
        );
        let visible_center = project(column_pos, h_to_v);
        let field_lower_bound = Int2::new(
            visible_center.x - vld.radius,
            visible_center.y - vld.radius,
        );
        let iter_lower_bound = Int2::new(field_lower_bound.x.max(0), field_lower_bound.y.max(0));
        let iter_upper_bound = Int2::new(
            (visible_center.x + vld.radius).min(vld.size.x - 1),
            (visible_center.y + vld.radius).min(vld.size.y - 1),
        );

        for ix in iter_lower_bound.x..=iter_upper_bound.x {
            for iy in iter_lower_bound.y..=iter_upper_bound.y {
                let visible_column_index =
                    address2(Int2::new(ix, iy), Int2::new(vld.size.x, vld.size.y));
                let in_ci = input_cis_prev[visible_column_index] as usize;
                let gate = gates[visible_column_index];
                let offset = Int2::new(ix - field_lower_bound.x, iy - field_lower_bound.y);

                // index within this column's slab
                let wi_start = num_hc
                    * (offset.y as usize
                        + diam as usize * (offset.x as usize + diam as usize * in_ci));

                for hc in 0..num_hc {
                    let delta = rng.round(
                        params.lr * 255.0 * gate * hidden_deltas[hc + hidden_cells_start],
                    );

                    slab[hc + wi_start] = (slab[hc + wi_start] as i32 + delta).clamp(0, 255) as u8;
                }
            }
        }
    }

    /// Learn from the previous forward against `hidden_target_cis`, then run
    /// a fresh forward on `input_cis` and capture them for the next learn.
    pub fn step(
        &mut self,
        input_cis: &[&[i32]],
        hidden_target_cis: &[i32],
        learn_enabled: bool,
        params: &Params,
        rng: &mut Rng,
    ) {
        let hidden_size = self.hidden_size;
        let num_hidden_columns = hidden_size.num_columns();
        let num_hc = hidden_size.z as usize;

        if learn_enabled {
            // cross-entropy deltas against the previous forward's softmax
            self.hidden_deltas
                .par_chunks_mut(num_hc)
                .enumerate()
                .for_each(|(i, deltas)| {
                    let target_ci = hidden_target_cis[i] as usize;
                    let cells_start = i * num_hc;

                    for hc in 0..num_hc {
                        deltas[hc] =
                            (hc == target_ci) as i32 as f32 - self.hidden_acts[hc + cells_start];
                    }
                });

            for vli in 0..self.visible_layers.len() {
                let vld = self.visible_layer_descs[vli].clone();
                let num_visible_columns = vld.size.num_columns();
                let hidden_deltas = &self.hidden_deltas;

                self.visible_layers[vli].gates = (0..num_visible_columns)
                    .into_par_iter()
                    .map(|i| {
                        let column_pos = Int2::new(
                            (i / vld.size.y as usize) as i32,
                            (i % vld.size.y as usize) as i32,
                        );
                        Self::update_gates_column(
                            column_pos,
                            hidden_size,
                            &vld,
                            hidden_deltas,
                            params,
                        )
                    })
                    .collect();
            }

            let base = rng.split();

            for vli in 0..self.visible_layers.len() {
                let vld = self.visible_layer_descs[vli].clone();
                let diam = (vld.radius * 2 + 1) as usize;
                let slab_size = num_hc * diam * diam * vld.size.z as usize;

                let VisibleLayer {
                    weights,
                    input_cis_prev,
                    gates,
                } = &mut self.visible_layers[vli];

                let input_cis_prev = &input_cis_prev[..];
                let gates = &gates[..];
                let hidden_deltas = &self.hidden_deltas;

                weights
                    .par_chunks_mut(slab_size)
                    .enumerate()
                    .for_each(|(i, slab)| {
                        let column_pos = Int2::new(
                            (i / hidden_size.y as usize) as i32,
                            (i % hidden_size.y as usize) as i32,
                        );
                        let mut column_rng =
                            Rng::substream(base, (vli * num_hidden_columns + i) as u64);

                        Self::learn_column(
                            column_pos,
                            hidden_size,
                            &vld,
                            slab,
                            input_cis_prev,
                            gates,
                            hidden_deltas,
                            &mut column_rng,
                            params,
                        );
                    });
            }
        }

        let results: Vec<ForwardResult> = (0..num_hidden_columns)
            .into_par_iter()
            .map(|i| {
                let column_pos = Int2::new(
                    (i / hidden_size.y as usize) as i32,
                    (i % hidden_size.y as usize) as i32,
                );
                Self::forward_column(
                    column_pos,
                    hidden_size,
                    &self.visible_layers,
                    &self.visible_layer_descs,
                    input_cis,
                    params,
                )
            })
            .collect();

        for (i, res) in results.into_iter().enumerate() {
            self.hidden_cis[i] = res.hidden_ci;
            self.hidden_sums[i * num_hc..(i + 1) * num_hc].copy_from_slice(&res.hidden_sums);
            self.hidden_acts[i * num_hc..(i + 1) * num_hc].copy_from_slice(&res.hidden_acts);
        }

        for (vl, &cis) in self.visible_layers.iter_mut().zip(input_cis.iter()) {
            vl.input_cis_prev.copy_from_slice(cis);
        }
    }

    pub fn clear_state(&mut self) {
        self.hidden_cis.fill(0);
        self.hidden_sums.fill(0);
        self.hidden_acts.fill(0.0);

        for vl in &mut self.visible_layers {
            vl.input_cis_prev.fill(0);
        }
    }

    pub fn get_hidden_cis(&self) -> &[i32] {
        &self.hidden_cis
    }

    pub fn get_hidden_acts(&self) -> &[f32] {
        &self.hidden_acts
    }

    pub fn get_hidden_size(&self) -> Int3 {
        self.hidden_size
    }

    pub fn get_num_visible_layers(&self) -> usize {
        self.visible_layers.len()
    }

    pub fn get_visible_layer(&self, i: usize) -> &VisibleLayer {
        &self.visible_layers[i]
    }

    pub fn get_visible_layer_desc(&self, i: usize) -> &VisibleLayerDesc {
        &self.visible_layer_descs[i]
    }

    // Serialization

    /// Exact byte count of a `write` dump.
    pub fn size(&self) -> usize {
        let mut size = 3 * 4 + self.hidden_cis.len() * 4 + self.hidden_acts.len() * 4 + 4;

        for vl in &self.visible_layers {
            size += 3 * 4 + 4 + vl.weights.len() + vl.input_cis_prev.len() * 4;
        }

        size
    }

    /// Exact byte count of a `write_state` dump.
    pub fn state_size(&self) -> usize {
        let mut size = self.hidden_cis.len() * 4 + self.hidden_acts.len() * 4;

        for vl in &self.visible_layers {
            size += vl.input_cis_prev.len() * 4;
        }

        size
    }

    pub fn write(&self, writer: &mut dyn StreamWriter) {
        writer.write_int3(self.hidden_size);
        writer.write_i32_slice(&self.hidden_cis);
        writer.write_f32_slice(&self.hidden_acts);
        writer.write_i32(self.visible_layers.len() as i32);

        for (vl, vld) in self.visible_layers.iter().zip(self.visible_layer_descs.iter()) {
            writer.write_int3(vld.size);
            writer.write_i32(vld.radius);
            writer.write_u8_slice(&vl.weights);
            writer.write_i32_slice(&vl.input_cis_prev);
        }
    }

    pub fn read(reader: &mut dyn StreamReader) -> Result<Self> {
        let hidden_size = reader.read_int3()?;

        let num_hidden_columns = hidden_size.num_columns();
        let num_hidden_cells = hidden_size.num_cells();

        let mut hidden_cis = vec![0i32; num_hidden_columns];
        reader.read_i32_slice(&mut hidden_cis)?;

        let mut hidden_acts = vec![0.0f32; num_hidden_cells];
        reader.read_f32_slice(&mut hidden_acts)?;

        let num_visible_layers = reader.read_i32()? as usize;
        let mut visible_layers = Vec::with_capacity(num_visible_layers);
        let mut visible_layer_descs = Vec::with_capacity(num_visible_layers);

        for _ in 0..num_visible_layers {
            let size = reader.read_int3()?;
            let radius = reader.read_i32()?;
            let vld = VisibleLayerDesc { size, radius };

            let diam = vld.radius * 2 + 1;
            let area = (diam * diam) as usize;
            let weights_size = num_hidden_cells * area * vld.size.z as usize;
            let num_visible_columns = vld.size.num_columns();

            let mut weights = vec![0u8; weights_size];
            reader.read_u8_slice(&mut weights)?;

            let mut input_cis_prev = vec![0i32; num_visible_columns];
            reader.read_i32_slice(&mut input_cis_prev)?;

            visible_layers.push(VisibleLayer {
                weights,
                input_cis_prev,
                gates: vec![0.0f32; num_visible_columns],
            });
            visible_layer_descs.push(vld);
        }

        Ok(Self {
            hidden_size,
            hidden_cis,
            hidden_sums: vec![0i32; num_hidden_cells],
            hidden_acts,
            hidden_deltas: vec![0.0f32; num_hidden_cells],
            visible_layers,
            visible_layer_descs,
        })
    }

    pub fn write_state(&self, writer: &mut dyn StreamWriter) {
        writer.write_i32_slice(&self.hidden_cis);
        writer.write_f32_slice(&self.hidden_acts);

        for vl in &self.visible_layers {
            writer.write_i32_slice(&vl.input_cis_prev);
        }
    }

    pub fn read_state(&mut self, reader: &mut dyn StreamReader) -> Result<()> {
        reader.read_i32_slice(&mut self.hidden_cis)?;
        reader.read_f32_slice(&mut self.hidden_acts)?;

        for vl in &mut self.visible_layers {
            reader.read_i32_slice(&mut vl.input_cis_prev)?;
        }

        Ok(())
    }
}
