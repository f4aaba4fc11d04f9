// sph - Encoder (competitive sparse coder with reconstruction-gated learning)
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

/// Per-input state of the encoder. `recon_sums` and `recon_deltas` are
/// scratch for the reconstruction/gate pass and are rebuilt every learn
/// step; only `weights` and `importance` carry across steps.
#[derive(Clone, Debug, Default)]
pub struct VisibleLayer {
    pub weights: ByteBuffer,
    pub recon_sums: IntBuffer,
    pub recon_deltas: FloatBuffer,
    pub importance: f32,
}

#[derive(Clone, Debug)]
pub struct Params {
    /// Softmax sharpness of the hidden-cell competition.
    pub scale: f32,
    /// Byte-weight learning rate.
    pub lr: f32,
    /// Gate falloff on reconstruction error.
    pub gcurve: f32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            scale: 8.0,
            lr: 0.02,
            gcurve: 16.0,
        }
    }
}

// Result of one column's forward pass
struct ForwardResult {
    hidden_ci: i32,
    hidden_acts: Vec<f32>,
}

/// Maps a set of visible column-index fields to a sparse hidden code: per
/// hidden column, the cell whose byte weights best match the current visible
/// patches wins. Learning nudges the winner's weights toward reconstructing
/// the inputs, damped by a per-visible-column gate where reconstruction
/// error is large.
#[derive(Clone, Debug, Default)]
pub struct Encoder {
    hidden_size: Int3,
    hidden_cis: IntBuffer,
    hidden_acts: FloatBuffer,
    pub visible_layers: Vec<VisibleLayer>,
    pub visible_layer_descs: Vec<VisibleLayerDesc>,
}

impl Encoder {
    pub fn new(hidden_size: Int3, visible_layer_descs: Vec<VisibleLayerDesc>, rng: &mut Rng) -> Result<Self> {
        if hidden_size.x <= 0 || hidden_size.y <= 0 || hidden_size.z <= 0 {
            return Err(Error::Configuration(format!(
                "encoder hidden size has a zero or negative dimension: {hidden_size:?}"
            )));
        }
        if visible_layer_descs.is_empty() {
            return Err(Error::Configuration("encoder has no visible layers".into()));
        }

        for vld in &visible_layer_descs {
            if vld.size.x <= 0 || vld.size.y <= 0 || vld.size.z <= 0 {
                return Err(Error::Configuration(format!(
                    "encoder visible layer has a zero or negative dimension: {:?}",
                    vld.size
                )));
            }
            if vld.radius < 0 {
                return Err(Error::Configuration(format!(
                    "encoder visible layer radius is negative: {}",
                    vld.radius
                )));
            }
        }

        let num_hidden_columns = hidden_size.num_columns();
        let num_hidden_cells = hidden_size.num_cells();

        let visible_layers = visible_layer_descs
            .iter()
            .map(|vld| {
                let diam = vld.radius * 2 + 1;
                let area = (diam * diam) as usize;
                let weights_size = num_hidden_cells * area * vld.size.z as usize;
                let num_visible_cells = vld.size.num_cells();

                let weights: ByteBuffer = (0..weights_size)
                    .map(|_| rng.next_below(INIT_WEIGHT_NOISEI) as u8)
                    .collect();

                VisibleLayer {
                    weights,
                    recon_sums: vec![0i32; num_visible_cells],
                    recon_deltas: vec![0.0f32; num_visible_cells],
                    importance: 1.0,
                }
            })
            .collect();

        Ok(Self {
            hidden_size,
            hidden_cis: vec![0i32; num_hidden_columns],
            hidden_acts: vec![0.0f32; num_hidden_cells],
            visible_layers,
            visible_layer_descs,
        })
    }

    // Match scores for all cells of one hidden column, softmaxed; winner is
    // the argmax with ties broken toward the lowest index.
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

        let mut acts = vec![0.0f32; num_hc];
        let mut total_count = 0.0f32;

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

            let sub_count = (iter_upper_bound.x - iter_lower_bound.x + 1)
                * (iter_upper_bound.y - iter_lower_bound.y + 1);
            total_count += vl.importance * sub_count as f32;

            let influence = vl.importance * BYTE_INV;
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
                        acts[hc] += vl.weights[hc + wi_start] as f32 * influence;
                    }
                }
            }
        }

        let rescale = 1.0 / LIMIT_SMALL.max(total_count);

        let mut max_index = 0usize;
        let mut max_activation = f32::NEG_INFINITY;

        for hc in 0..num_hc {
            acts[hc] *= rescale;

            if acts[hc] > max_activation {
                max_activation = acts[hc];
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
            hidden_acts: acts,
        }
    }

    // Reconstruction pass for one visible column: project the current
    // winners back through the weights, softmax the sums, and store the
    // gated one-hot delta for the learn pass.
    #[allow(clippy::too_many_arguments)]
    fn update_gates_column(
        column_pos: Int2,
        hidden_size: Int3,
        vld: &VisibleLayerDesc,
        weights: &[u8],
        hidden_cis: &[i32],
        input_cis: &[i32],
        recon_sums: &mut [i32],
        recon_deltas: &mut [f32],
        params: &Params,
    ) {
        let visible_column_index =
            address2(column_pos, Int2::new(vld.size.x, vld.size.y));
        let num_vc = vld.size.z as usize;
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

        recon_sums.fill(0);

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
                    let hidden_ci = hidden_cis[hidden_column_index] as usize;
                    let offset = Int2::new(
                        column_pos.x - visible_center.x + vld.radius,
                        column_pos.y - visible_center.y + vld.radius,
                    );

                    count += 1;

                    for vc in 0..num_vc {
                        let wi = hidden_ci
                            + num_hc
                                * (offset.y as usize
                                    + diam as usize
                                        * (offset.x as usize
                                            + diam as usize
                                                * (vc + num_vc * hidden_column_index)));

                        recon_sums[vc] += weights[wi] as i32;
                    }
                }
            }
        }

        let norm = 1.0 / (255.0 * count.max(1) as f32);

        let mut max_activation = f32::NEG_INFINITY;
        for vc in 0..num_vc {
            let act = recon_sums[vc] as f32 * norm;
            recon_deltas[vc] = act;
            max_activation = max_activation.max(act);
        }

        let mut total = 0.0f32;
        for vc in 0..num_vc {
            recon_deltas[vc] = (params.scale * (recon_deltas[vc] - max_activation)).exp();
            total += recon_deltas[vc];
        }
        let total_inv = 1.0 / LIMIT_SMALL.max(total);

        let target_ci = input_cis[visible_column_index] as usize;

        let mut sq_error = 0.0f32;
        for vc in 0..num_vc {
            let predicted = recon_deltas[vc] * total_inv;
            let delta = (vc == target_ci) as i32 as f32 - predicted;
            recon_deltas[vc] = delta;
            sq_error += delta * delta;
        }

        // mean squared delta keeps the gate scale independent of column depth
        let gate = (-params.gcurve * sq_error / num_vc as f32).exp();

        for vc in 0..num_vc {
            recon_deltas[vc] *= gate;
        }
    }

    // Saturating byte update for one hidden column's weight slab of one
    // visible layer, addressed by the winning cell.
    #[allow(clippy::too_many_arguments)]
    fn learn_column(
        column_pos: Int2,
        hidden_size: Int3,
        vld: &VisibleLayerDesc,
        slab: &mut [u8],
        hidden_ci: usize,
        recon_deltas: &[f32],
        rng: &mut Rng,
        params: &Params,
    ) {
        let num_hc = hidden_size.z as usize;
        let num_vc = vld.size.z as usize;
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
                let visible_cells_start = visible_column_index * num_vc;
                let offset = Int2::new(ix - field_lower_bound.x, iy - field_lower_bound.y);

                for vc in 0..num_vc {
                    // index within this column's slab
                    let wi = hidden_ci
                        + num_hc
                            * (offset.y as usize
                                + diam as usize * (offset.x as usize + diam as usize * vc));

                    let delta =
                        rng.round(params.lr * 255.0 * recon_deltas[vc + visible_cells_start]);

                    slab[wi] = (slab[wi] as i32 + delta).clamp(0, 255) as u8;
                }
            }
        }
    }

    pub fn step(&mut self, input_cis: &[&[i32]], learn_enabled: bool, params: &Params, rng: &mut Rng) {
        let hidden_size = self.hidden_size;
        let num_hidden_columns = hidden_size.num_columns();
        let num_hc = hidden_size.z as usize;

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
            self.hidden_acts[i * num_hc..(i + 1) * num_hc].copy_from_slice(&res.hidden_acts);
        }

        if !learn_enabled {
            return;
        }

        // Reconstruction gates, per visible column of each input
        for vli in 0..self.visible_layers.len() {
            let vld = self.visible_layer_descs[vli].clone();
            let num_vc = vld.size.z as usize;
            let vl_input_cis = input_cis[vli];

            let VisibleLayer {
                weights,
                recon_sums,
                recon_deltas,
                ..
            } = &mut self.visible_layers[vli];

            let hidden_cis = &self.hidden_cis;
            let weights = &weights[..];

            recon_sums
                .par_chunks_mut(num_vc)
                .zip(recon_deltas.par_chunks_mut(num_vc))
                .enumerate()
                .for_each(|(i, (sums, deltas))| {
                    let column_pos = Int2::new(
                        (i / vld.size.y as usize) as i32,
                        (i % vld.size.y as usize) as i32,
                    );
                    Self::update_gates_column(
                        column_pos,
                        hidden_size,
                        &vld,
                        weights,
                        hidden_cis,
                        vl_input_cis,
                        sums,
                        deltas,
                        params,
                    );
                });
        }

        // Weight update, per hidden-column slab. Each hidden column owns a
        // contiguous run of weights, so the chunked split is exact.
        let base = rng.split();

        for vli in 0..self.visible_layers.len() {
            let vld = self.visible_layer_descs[vli].clone();
            let diam = (vld.radius * 2 + 1) as usize;
            let slab_size = num_hc * diam * diam * vld.size.z as usize;

            let VisibleLayer {
                weights,
                recon_deltas,
                ..
            } = &mut self.visible_layers[vli];

            let hidden_cis = &self.hidden_cis;
            let recon_deltas = &recon_deltas[..];

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
                        hidden_cis[i] as usize,
                        recon_deltas,
                        &mut column_rng,
                        params,
                    );
                });
        }
    }

    pub fn clear_state(&mut self) {
        self.hidden_cis.fill(0);
        self.hidden_acts.fill(0.0);
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

    pub fn get_visible_layer_mut(&mut self, i: usize) -> &mut VisibleLayer {
        &mut self.visible_layers[i]
    }

    pub fn get_visible_layer_desc(&self, i: usize) -> &VisibleLayerDesc {
        &self.visible_layer_descs[i]
    }

    // Serialization

    /// Exact byte count of a `write` dump.
    pub fn size(&self) -> usize {
        let mut size = 3 * 4 + self.hidden_cis.len() * 4 + 4;

        for vl in &self.visible_layers {
            size += 3 * 4 + 4 + vl.weights.len() + 4;
        }

        size
    }

    /// Exact byte count of a `write_state` dump.
    pub fn state_size(&self) -> usize {
        self.hidden_cis.len() * 4
    }

    pub fn write(&self, writer: &mut dyn StreamWriter) {
        writer.write_int3(self.hidden_size);
        writer.write_i32_slice(&self.hidden_cis);
        writer.write_i32(self.visible_layers.len() as i32);

        for (vl, vld) in self.visible_layers.iter().zip(self.visible_layer_descs.iter()) {
            writer.write_int3(vld.size);
            writer.write_i32(vld.radius);
            writer.write_u8_slice(&vl.weights);
            writer.write_f32(vl.importance);
        }
    }

    pub fn read(reader: &mut dyn StreamReader) -> Result<Self> {
        let hidden_size = reader.read_int3()?;

        let num_hidden_columns = hidden_size.num_columns();
        let num_hidden_cells = hidden_size.num_cells();

        let mut hidden_cis = vec![0i32; num_hidden_columns];
        reader.read_i32_slice(&mut hidden_cis)?;

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
            let num_visible_cells = vld.size.num_cells();

            let mut weights = vec![0u8; weights_size];
            reader.read_u8_slice(&mut weights)?;

            let importance = reader.read_f32()?;

            visible_layers.push(VisibleLayer {
                weights,
                recon_sums: vec![0i32; num_visible_cells],
                recon_deltas: vec![0.0f32; num_visible_cells],
                importance,
            });
            visible_layer_descs.push(vld);
        }

        Ok(Self {
            hidden_size,
            hidden_cis,
            hidden_acts: vec![0.0f32; num_hidden_cells],
            visible_layers,
            visible_layer_descs,
        })
    }

    pub fn write_state(&self, writer: &mut dyn StreamWriter) {
        writer.write_i32_slice(&self.hidden_cis);
    }

    pub fn read_state(&mut self, reader: &mut dyn StreamReader) -> Result<()> {
        reader.read_i32_slice(&mut self.hidden_cis)
    }
}
