// sph - Actor (per-column advantage actor-critic with replayed history)
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

/// The value and policy heads share patch geometry over each input.
#[derive(Clone, Debug, Default)]
pub struct VisibleLayer {
    pub value_weights: FloatBuffer,
    pub action_weights: FloatBuffer,
}

/// One timestep of replay memory: the inputs the actor saw, the action
/// indices it was told it should have produced on the previous tick, and the
/// reward that arrived with them.
#[derive(Clone, Debug, Default)]
pub struct HistorySample {
    pub input_cis: Vec<IntBuffer>,
    pub hidden_target_cis_prev: IntBuffer,
    pub reward: f32,
}

#[derive(Clone, Debug)]
pub struct Params {
    /// Value-head learning rate.
    pub vlr: f32,
    /// Policy-head learning rate.
    pub alr: f32,
    /// Reward discount.
    pub discount: f32,
    /// Samples younger than this are never replayed.
    pub min_steps: usize,
    /// Replay passes per step.
    pub history_iters: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            vlr: 0.02,
            alr: 0.02,
            discount: 0.99,
            min_steps: 8,
            history_iters: 8,
        }
    }
}

// Result of one column's forward pass
struct ForwardResult {
    hidden_ci: i32,
    value: f32,
    hidden_acts: Vec<f32>,
}

// Per-column deltas computed by a replay pass, applied in a second phase
struct LearnResult {
    value_delta: f32,
    action_deltas: Vec<f32>,
}

/// Produces one discrete action per output column and learns from scalar
/// reward via replayed n-step returns over a fixed-capacity history ring.
#[derive(Clone, Debug, Default)]
pub struct Actor {
    hidden_size: Int3,
    history_size: usize,
    hidden_cis: IntBuffer,
    hidden_acts: FloatBuffer,
    hidden_values: FloatBuffer,
    history_samples: CircleBuffer<HistorySample>,
    pub visible_layers: Vec<VisibleLayer>,
    pub visible_layer_descs: Vec<VisibleLayerDesc>,
}

impl Actor {
    pub fn new(
        hidden_size: Int3,
        history_capacity: usize,
        visible_layer_descs: Vec<VisibleLayerDesc>,
        rng: &mut Rng,
    ) -> Result<Self> {
        if hidden_size.x <= 0 || hidden_size.y <= 0 || hidden_size.z <= 0 {
            return Err(Error::Configuration(format!(
                "actor hidden size has a zero or negative dimension: {hidden_size:?}"
            )));
        }
        if history_capacity < 2 {
            return Err(Error::Configuration(format!(
                "actor history capacity must be at least 2, got {history_capacity}"
            )));
        }
        if visible_layer_descs.is_empty() {
            return Err(Error::Configuration("actor has no visible layers".into()));
        }

        for vld in &visible_layer_descs {
            if vld.size.x <= 0 || vld.size.y <= 0 || vld.size.z <= 0 {
                return Err(Error::Configuration(format!(
                    "actor visible layer has a zero or negative dimension: {:?}",
                    vld.size
                )));
            }
            if vld.radius < 0 {
                return Err(Error::Configuration(format!(
                    "actor visible layer radius is negative: {}",
                    vld.radius
                )));
            }
        }

        let num_hidden_columns = hidden_size.num_columns();
        let num_hidden_cells = hidden_size.num_cells();

        let visible_layers: Vec<VisibleLayer> = visible_layer_descs
            .iter()
            .map(|vld| {
                let diam = vld.radius * 2 + 1;
                let area = (diam * diam) as usize;

                let value_weights: FloatBuffer = (0..num_hidden_columns
                    * area
                    * vld.size.z as usize)
                    .map(|_| rng.range_f32(-INIT_WEIGHT_NOISEF, INIT_WEIGHT_NOISEF))
                    .collect();

                let action_weights: FloatBuffer = (0..num_hidden_cells
                    * area
                    * vld.size.z as usize)
                    .map(|_| rng.range_f32(-INIT_WEIGHT_NOISEF, INIT_WEIGHT_NOISEF))
                    .collect();

                VisibleLayer {
                    value_weights,
                    action_weights,
                }
            })
            .collect();

        let mut history_samples: CircleBuffer<HistorySample> = CircleBuffer::new(history_capacity);

        for i in 0..history_capacity {
            let sample = history_samples.get_mut(i);
            sample.input_cis = visible_layer_descs
                .iter()
                .map(|vld| vec![0i32; vld.size.num_columns()])
                .collect();
            sample.hidden_target_cis_prev = vec![0i32; num_hidden_columns];
            sample.reward = 0.0;
        }

        Ok(Self {
            hidden_size,
            history_size: 0,
            hidden_cis: vec![0i32; num_hidden_columns],
            hidden_acts: vec![0.0f32; num_hidden_cells],
            hidden_values: vec![0.0f32; num_hidden_columns],
            history_samples,
            visible_layers,
            visible_layer_descs,
        })
    }

    // Both heads for one column: scalar value and the action softmax.
    fn accumulate_column(
        column_pos: Int2,
        hidden_size: Int3,
        visible_layers: &[VisibleLayer],
        visible_layer_descs: &[VisibleLayerDesc],
        input_cis: &[&[i32]],
    ) -> (f32, Vec<f32>) {
        let hidden_column_index = address2(column_pos, Int2::new(hidden_size.x, hidden_size.y));
        let num_hc = hidden_size.z as usize;

        let mut value_sum = 0.0f32;
        let mut action_sums = vec![0.0f32; num_hc];
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

                    let wi_partial = offset.y as usize
                        + diam as usize
                            * (offset.x as usize
                                + diam as usize
                                    * (in_ci + vld.size.z as usize * hidden_column_index));

                    value_sum += vl.value_weights[wi_partial];

                    let wi_start = num_hc * wi_partial;

                    for hc in 0..num_hc {
                        action_sums[hc] += vl.action_weights[hc + wi_start];
                    }
                }
            }
        }

        let rescale = 1.0 / count.max(1) as f32;

        let value = value_sum * rescale;

        let mut max_activation = f32::NEG_INFINITY;
        for hc in 0..num_hc {
            action_sums[hc] *= rescale;
            max_activation = max_activation.max(action_sums[hc]);
        }

        let mut total = 0.0f32;
        for hc in 0..num_hc {
            action_sums[hc] = (action_sums[hc] - max_activation).exp();
            total += action_sums[hc];
        }
        let total_inv = 1.0 / LIMIT_SMALL.max(total);
        for hc in 0..num_hc {
            action_sums[hc] *= total_inv;
        }

        (value, action_sums)
    }

    fn forward_column(
        column_pos: Int2,
        hidden_size: Int3,
        visible_layers: &[VisibleLayer],
        visible_layer_descs: &[VisibleLayerDesc],
        input_cis: &[&[i32]],
        greedy: bool,
        rng: &mut Rng,
    ) -> ForwardResult {
        let (value, acts) = Self::accumulate_column(
            column_pos,
            hidden_size,
            visible_layers,
            visible_layer_descs,
            input_cis,
        );

        let num_hc = hidden_size.z as usize;

        let hidden_ci = if greedy {
            let mut max_index = 0usize;
            let mut max_act = f32::NEG_INFINITY;
            for hc in 0..num_hc {
                if acts[hc] > max_act {
                    max_act = acts[hc];
                    max_index = hc;
                }
            }
            max_index
        } else {
            let cusp = rng.next_f32();
            let mut select_index = num_hc - 1;
            let mut sum_so_far = 0.0f32;
            for hc in 0..num_hc {
                sum_so_far += acts[hc];
                if sum_so_far >= cusp {
                    select_index = hc;
                    break;
                }
            }
            select_index
        };

        ForwardResult {
            hidden_ci: hidden_ci as i32,
            value,
            hidden_acts: acts,
        }
    }

    /// Select actions for the current inputs, record a history sample, and
    /// (when enabled and warmed up) run replay passes of n-step TD learning.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        input_cis: &[&[i32]],
        hidden_target_cis_prev: &[i32],
        learn_enabled: bool,
        reward: f32,
        mimic: f32,
        params: &Params,
        rng: &mut Rng,
    ) {
        let hidden_size = self.hidden_size;
        let num_hidden_columns = hidden_size.num_columns();
        let num_hc = hidden_size.z as usize;

        let greedy = mimic > 0.0;
        let base = rng.split();

        let results: Vec<ForwardResult> = (0..num_hidden_columns)
            .into_par_iter()
            .map(|i| {
                let column_pos = Int2::new(
                    (i / hidden_size.y as usize) as i32,
                    (i % hidden_size.y as usize) as i32,
                );
                let mut column_rng = Rng::substream(base, i as u64);

                Self::forward_column(
                    column_pos,
                    hidden_size,
                    &self.visible_layers,
                    &self.visible_layer_descs,
                    input_cis,
                    greedy,
                    &mut column_rng,
                )
            })
            .collect();

        for (i, res) in results.into_iter().enumerate() {
            self.hidden_cis[i] = res.hidden_ci;
            self.hidden_values[i] = res.value;
            self.hidden_acts[i * num_hc..(i + 1) * num_hc].copy_from_slice(&res.hidden_acts);
        }

        self.history_samples.push_front();

        if self.history_size < self.history_samples.len() {
            self.history_size += 1;
        }

        {
            let sample = self.history_samples.front_mut();
            for (dst, &src) in sample.input_cis.iter_mut().zip(input_cis.iter()) {
                dst.copy_from_slice(src);
            }
            sample
                .hidden_target_cis_prev
                .copy_from_slice(hidden_target_cis_prev);
            sample.reward = reward;
        }

        if !learn_enabled || self.history_size <= params.min_steps {
            return;
        }

        // replay offsets come from [max(min_steps, 1), history_size - 1)
        let t_low = params.min_steps.max(1);
        if self.history_size < t_low + 2 {
            return;
        }
        let span = (self.history_size - 1 - t_low) as u32;

        for _ in 0..params.history_iters {
            let t = t_low + rng.next_below(span) as usize;

            // return anchored at the newest ring entry: rewards discounted
            // going back in time, then the sample-t value as bootstrap
            let mut r = 0.0f32;
            let mut d = 1.0f32;

            for k in 0..t {
                r += self.history_samples.get(k).reward * d;
                d *= params.discount;
            }

            self.learn_pass(t, r, d, mimic, params);
        }
    }

    // One replay pass over sample `t`: compute per-column deltas from the
    // stored inputs, then apply them to both heads.
    fn learn_pass(&mut self, t: usize, r: f32, d: f32, mimic: f32, params: &Params) {
        let hidden_size = self.hidden_size;
        let num_hidden_columns = hidden_size.num_columns();
        let num_hc = hidden_size.z as usize;

        let sample = self.history_samples.get(t);
        let sample_inputs: Vec<&[i32]> =
            sample.input_cis.iter().map(|v| v.as_slice()).collect();
        let target_cis = self.history_samples.get(t - 1).hidden_target_cis_prev.as_slice();
        let hidden_values = &self.hidden_values;
        let visible_layers = &self.visible_layers;
        let visible_layer_descs = &self.visible_layer_descs;

        let learn_results: Vec<LearnResult> = (0..num_hidden_columns)
            .into_par_iter()
            .map(|i| {
                let column_pos = Int2::new(
                    (i / hidden_size.y as usize) as i32,
                    (i % hidden_size.y as usize) as i32,
                );

                let (value_t, acts_t) = Self::accumulate_column(
                    column_pos,
                    hidden_size,
                    visible_layers,
                    visible_layer_descs,
                    &sample_inputs,
                );

                // advantage of the replayed return over the newest value
                let advantage = r + d * value_t - hidden_values[i];

                let target_ci = target_cis[i] as usize;
                let action_error = params.alr * ((1.0 - mimic) * advantage + mimic);

                let action_deltas: Vec<f32> = (0..num_hc)
                    .map(|hc| action_error * ((hc == target_ci) as i32 as f32 - acts_t[hc]))
                    .collect();

                LearnResult {
                    value_delta: params.vlr * advantage,
                    action_deltas,
                }
            })
            .collect();

        for vli in 0..self.visible_layers.len() {
            let vld = self.visible_layer_descs[vli].clone();
            let diam = (vld.radius * 2 + 1) as usize;
            let value_slab_size = diam * diam * vld.size.z as usize;
            let action_slab_size = num_hc * value_slab_size;

            let sample_input_cis = self.history_samples.get(t).input_cis[vli].as_slice();

            let VisibleLayer {
                value_weights,
                action_weights,
            } = &mut self.visible_layers[vli];

            let learn_results = &learn_results;

            value_weights
                .par_chunks_mut(value_slab_size)
                .zip(action_weights.par_chunks_mut(action_slab_size))
                .enumerate()
                .for_each(|(i, (value_slab, action_slab))| {
                    let column_pos = Int2::new(
                        (i / hidden_size.y as usize) as i32,
                        (i % hidden_size.y as usize) as i32,
                    );

                    Self::apply_column(
                        column_pos,
                        hidden_size,
                        &vld,
                        value_slab,
                        action_slab,
                        sample_input_cis,
                        &learn_results[i],
                    );
                });
        }
    }

    // Add one column's deltas into its weight slabs, addressed by the
    // replayed sample's inputs.
    fn apply_column(
        column_pos: Int2,
        hidden_size: Int3,
        vld: &VisibleLayerDesc,
        value_slab: &mut [f32],
        action_slab: &mut [f32],
        input_cis: &[i32],
        deltas: &LearnResult,
    ) {
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
                let in_ci = input_cis[visible_column_index] as usize;
                let offset = Int2::new(ix - field_lower_bound.x, iy - field_lower_bound.y);

                // index within this column's slab
                let wi_partial = offset.y as usize
                    + diam as usize * (offset.x as usize + diam as usize * in_ci);

                value_slab[wi_partial] += deltas.value_delta;

                let wi_start = num_hc * wi_partial;

                for hc in 0..num_hc {
                    action_slab[hc + wi_start] += deltas.action_deltas[hc];
                }
            }
        }
    }

    pub fn clear_state(&mut self) {
        self.hidden_cis.fill(0);
        self.hidden_acts.fill(0.0);
        self.hidden_values.fill(0.0);
        self.history_size = 0;
        self.history_samples.set_start(0);

        for i in 0..self.history_samples.len() {
            let sample = self.history_samples.get_mut(i);
            for cis in &mut sample.input_cis {
                cis.fill(0);
            }
            sample.hidden_target_cis_prev.fill(0);
            sample.reward = 0.0;
        }
    }

    pub fn get_hidden_cis(&self) -> &[i32] {
        &self.hidden_cis
    }

    pub fn get_hidden_acts(&self) -> &[f32] {
        &self.hidden_acts
    }

    pub fn get_hidden_values(&self) -> &[f32] {
        &self.hidden_values
    }

    pub fn get_hidden_size(&self) -> Int3 {
        self.hidden_size
    }

    pub fn get_history_capacity(&self) -> usize {
        self.history_samples.len()
    }

    pub fn get_history_size(&self) -> usize {
        self.history_size
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

    fn sample_bytes(&self) -> usize {
        let num_hidden_columns = self.hidden_size.num_columns();

        let mut size = num_hidden_columns * 4 + 4;

        for vld in &self.visible_layer_descs {
            size += vld.size.num_columns() * 4;
        }

        size
    }

    /// Exact byte count of a `write` dump.
    pub fn size(&self) -> usize {
        let mut size = 3 * 4
            + self.hidden_cis.len() * 4
            + self.hidden_values.len() * 4
            + self.hidden_acts.len() * 4
            + 4;

        for vl in &self.visible_layers {
            size += 3 * 4 + 4 + vl.value_weights.len() * 4 + vl.action_weights.len() * 4;
        }

        size + 3 * 4 + self.history_samples.len() * self.sample_bytes()
    }

    /// Exact byte count of a `write_state` dump.
    pub fn state_size(&self) -> usize {
        self.hidden_cis.len() * 4
            + self.hidden_values.len() * 4
            + self.hidden_acts.len() * 4
            + 2 * 4
            + self.history_samples.len() * self.sample_bytes()
    }

    pub fn write(&self, writer: &mut dyn StreamWriter) {
        writer.write_int3(self.hidden_size);
        writer.write_i32_slice(&self.hidden_cis);
        writer.write_f32_slice(&self.hidden_values);
        writer.write_f32_slice(&self.hidden_acts);
        writer.write_i32(self.visible_layers.len() as i32);

        for (vl, vld) in self.visible_layers.iter().zip(self.visible_layer_descs.iter()) {
            writer.write_int3(vld.size);
            writer.write_i32(vld.radius);
            writer.write_f32_slice(&vl.value_weights);
            writer.write_f32_slice(&vl.action_weights);
        }

        writer.write_i32(self.history_size as i32);
        writer.write_i32(self.history_samples.len() as i32);
        writer.write_i32(self.history_samples.start() as i32);

        for t in 0..self.history_samples.len() {
            let sample = self.history_samples.get(t);

            for cis in &sample.input_cis {
                writer.write_i32_slice(cis);
            }
            writer.write_i32_slice(&sample.hidden_target_cis_prev);
            writer.write_f32(sample.reward);
        }
    }

    pub fn read(reader: &mut dyn StreamReader) -> Result<Self> {
        let hidden_size = reader.read_int3()?;

        let num_hidden_columns = hidden_size.num_columns();
        let num_hidden_cells = hidden_size.num_cells();

        let mut hidden_cis = vec![0i32; num_hidden_columns];
        reader.read_i32_slice(&mut hidden_cis)?;

        let mut hidden_values = vec![0.0f32; num_hidden_columns];
        reader.read_f32_slice(&mut hidden_values)?;

        let mut hidden_acts = vec![0.0f32; num_hidden_cells];
        reader.read_f32_slice(&mut hidden_acts)?;

        let num_visible_layers = reader.read_i32()? as usize;
        let mut visible_layers = Vec::with_capacity(num_visible_layers);
        let mut visible_layer_descs: Vec<VisibleLayerDesc> =
            Vec::with_capacity(num_visible_layers);

        for _ in 0..num_visible_layers {
            let size = reader.read_int3()?;
            let radius = reader.read_i32()?;
            let vld = VisibleLayerDesc { size, radius };

            let diam = vld.radius * 2 + 1;
            let area = (diam * diam) as usize;

            let mut value_weights =
                vec![0.0f32; num_hidden_columns * area * vld.size.z as usize];
            reader.read_f32_slice(&mut value_weights)?;

            let mut action_weights = vec![0.0f32; num_hidden_cells * area * vld.size.z as usize];
            reader.read_f32_slice(&mut action_weights)?;

            visible_layers.push(VisibleLayer {
                value_weights,
                action_weights,
            });
            visible_layer_descs.push(vld);
        }

        let history_size = reader.read_i32()? as usize;
        let history_capacity = reader.read_i32()? as usize;
        let history_start = reader.read_i32()? as usize;

        let mut history_samples = CircleBuffer::new(history_capacity);
        history_samples.set_start(history_start);

        for t in 0..history_capacity {
            let mut input_cis = Vec::with_capacity(num_visible_layers);

            for vld in &visible_layer_descs {
                let mut cis = vec![0i32; vld.size.num_columns()];
                reader.read_i32_slice(&mut cis)?;
                input_cis.push(cis);
            }

            let mut hidden_target_cis_prev = vec![0i32; num_hidden_columns];
            reader.read_i32_slice(&mut hidden_target_cis_prev)?;

            let reward = reader.read_f32()?;

            *history_samples.get_mut(t) = HistorySample {
                input_cis,
                hidden_target_cis_prev,
                reward,
            };
        }

        Ok(Self {
            hidden_size,
            history_size,
            hidden_cis,
            hidden_acts,
            hidden_values,
            history_samples,
            visible_layers,
            visible_layer_descs,
        })
    }

    pub fn write_state(&self, writer: &mut dyn StreamWriter) {
        writer.write_i32_slice(&self.hidden_cis);
        writer.write_f32_slice(&self.hidden_values);
        writer.write_f32_slice(&self.hidden_acts);
        writer.write_i32(self.history_size as i32);
        writer.write_i32(self.history_samples.start() as i32);

        for t in 0..self.history_samples.len() {
            let sample = self.history_samples.get(t);

            for cis in &sample.input_cis {
                writer.write_i32_slice(cis);
            }
            writer.write_i32_slice(&sample.hidden_target_cis_prev);
            writer.write_f32(sample.reward);
        }
    }

    pub fn read_state(&mut self, reader: &mut dyn StreamReader) -> Result<()> {
        reader.read_i32_slice(&mut self.hidden_cis)?;
        reader.read_f32_slice(&mut self.hidden_values)?;
        reader.read_f32_slice(&mut self.hidden_acts)?;
        self.history_size = reader.read_i32()? as usize;
        let start = reader.read_i32()? as usize;
        self.history_samples.set_start(start);

        for t in 0..self.history_samples.len() {
            let sample = self.history_samples.get_mut(t);

            for cis in &mut sample.input_cis {
                reader.read_i32_slice(cis)?;
            }
            reader.read_i32_slice(&mut sample.hidden_target_cis_prev)?;
            sample.reward = reader.read_f32()?;
        }

        Ok(())
    }
}
