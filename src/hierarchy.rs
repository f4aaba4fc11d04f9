// sph - Hierarchy (multi-timescale orchestration of encoders, decoders, actors)
#![allow(clippy::needless_range_loop)]

use log::{debug, trace};

use crate::actor::{Actor, Params as ActorParams, VisibleLayerDesc as ActorVld};
use crate::decoder::{Decoder, Params as DecoderParams, VisibleLayerDesc as DecoderVld};
use crate::encoder::{Encoder, Params as EncoderParams, VisibleLayerDesc as EncoderVld};
use crate::error::{Error, Result};
use crate::helpers::*;

/// How the hierarchy treats one IO channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IoType {
    /// Input only; no prediction is produced for this channel.
    None = 0,
    /// A decoder at layer 0 predicts this channel's next value.
    #[default]
    Prediction = 1,
    /// An actor selects this channel's values, driven by reward.
    Action = 2,
}

impl From<u8> for IoType {
    fn from(v: u8) -> Self {
        match v {
            1 => IoType::Prediction,
            2 => IoType::Action,
            _ => IoType::None,
        }
    }
}

/// Structural descriptor for one IO channel. Fixed after construction.
#[derive(Clone, Debug)]
pub struct IoDesc {
    pub size: Int3,
    pub io_type: IoType,
    /// Receptive-field radius up into the layer-0 encoder.
    pub up_radius: i32,
    /// Receptive-field radius of the decoder or actor reading back down.
    pub down_radius: i32,
    /// Actor replay ring capacity. Ignored for non-action channels.
    pub history_capacity: usize,
}

impl Default for IoDesc {
    fn default() -> Self {
        Self {
            size: Int3::new(4, 4, 16),
            io_type: IoType::Prediction,
            up_radius: 2,
            down_radius: 2,
            history_capacity: 256,
        }
    }
}

/// Structural descriptor for one layer. Fixed after construction.
#[derive(Clone, Debug)]
pub struct LayerDesc {
    pub hidden_size: Int3,
    pub up_radius: i32,
    pub down_radius: i32,
    /// Lower-layer ticks between updates of this layer. Forced to 1 for
    /// layer 0.
    pub ticks_per_update: usize,
    /// Past ticks kept per input channel in this layer's history ring.
    /// Must be at least `ticks_per_update`.
    pub temporal_horizon: usize,
}

impl Default for LayerDesc {
    fn default() -> Self {
        Self {
            hidden_size: Int3::new(4, 4, 16),
            up_radius: 2,
            down_radius: 2,
            ticks_per_update: 2,
            temporal_horizon: 2,
        }
    }
}

/// Runtime hyperparameters for one layer. Adjustable between steps.
#[derive(Clone, Debug, Default)]
pub struct LayerParams {
    pub decoder: DecoderParams,
    pub encoder: EncoderParams,
}

/// Runtime hyperparameters for one IO channel. Adjustable between steps.
#[derive(Clone, Debug)]
pub struct IoParams {
    pub decoder: DecoderParams,
    pub actor: ActorParams,
    /// Weight of this channel's input in the layer-0 encoder competition.
    pub importance: f32,
}

impl Default for IoParams {
    fn default() -> Self {
        Self {
            decoder: DecoderParams::default(),
            actor: ActorParams::default(),
            importance: 1.0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Params {
    pub layers: Vec<LayerParams>,
    pub ios: Vec<IoParams>,
}

/// A sparse predictive hierarchy: a stack of encoders with exponentially
/// slowed update rates, histories that give each layer a temporal horizon
/// over the layer below, and decoders/actors that read predictions back out
/// of the bottom layer.
///
/// # Usage
/// ```rust,no_run
/// use sph::helpers::Int3;
/// use sph::hierarchy::{Hierarchy, IoDesc, IoType, LayerDesc};
///
/// let io_descs = vec![IoDesc {
///     size: Int3::new(4, 4, 16),
///     ..Default::default()
/// }];
/// let layer_descs = vec![LayerDesc::default(); 2];
///
/// let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();
///
/// let input = vec![0i32; 4 * 4];
/// h.step(&[&input], true, 0.0, 0.0).unwrap();
/// let prediction = h.get_prediction_cis(0).unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct Hierarchy {
    encoders: Vec<Encoder>,
    decoders: Vec<Vec<Decoder>>, // decoders[layer][slot]
    actors: Vec<Actor>,

    // maps decoder/actor slots back to channels and channels to slots
    i_indices: IntBuffer,
    d_indices: IntBuffer,

    // histories[layer][channel] is a ring of column-index fields
    histories: Vec<Vec<CircleBuffer<IntBuffer>>>,

    updates: Vec<bool>,
    ticks: Vec<usize>,
    ticks_per_update: Vec<usize>,

    io_sizes: Vec<Int3>,
    io_types: Vec<IoType>,

    rng: Rng,

    pub params: Params,
}

impl Hierarchy {
    pub fn new(io_descs: &[IoDesc], layer_descs: &[LayerDesc], seed: u64) -> Result<Self> {
        if io_descs.is_empty() {
            return Err(Error::Configuration("no io channels given".into()));
        }
        if layer_descs.is_empty() {
            return Err(Error::Configuration("no layers given".into()));
        }

        let num_layers = layer_descs.len();
        let num_io = io_descs.len();

        for (l, ld) in layer_descs.iter().enumerate() {
            if ld.temporal_horizon == 0 {
                return Err(Error::Configuration(format!(
                    "layer {l} has a zero temporal horizon"
                )));
            }
            if l > 0 && ld.ticks_per_update == 0 {
                return Err(Error::Configuration(format!(
                    "layer {l} has zero ticks per update"
                )));
            }
            if l > 0 && ld.ticks_per_update > ld.temporal_horizon {
                return Err(Error::Configuration(format!(
                    "layer {l} ticks per update ({}) exceeds its temporal horizon ({})",
                    ld.ticks_per_update, ld.temporal_horizon
                )));
            }
        }

        let mut rng = Rng::new(seed);

        let io_sizes: Vec<Int3> = io_descs.iter().map(|d| d.size).collect();
        let io_types: Vec<IoType> = io_descs.iter().map(|d| d.io_type).collect();

        let ticks_per_update: Vec<usize> = layer_descs
            .iter()
            .enumerate()
            .map(|(l, d)| if l == 0 { 1 } else { d.ticks_per_update })
            .collect();

        let num_predictions = io_types.iter().filter(|&&t| t == IoType::Prediction).count();
        let num_actions = io_types.iter().filter(|&&t| t == IoType::Action).count();

        let mut encoders: Vec<Encoder> = Vec::with_capacity(num_layers);
        let mut decoders: Vec<Vec<Decoder>> = Vec::with_capacity(num_layers);
        let mut actors: Vec<Actor> = Vec::with_capacity(num_actions);
        let mut histories: Vec<Vec<CircleBuffer<IntBuffer>>> = Vec::with_capacity(num_layers);

        let mut i_indices = vec![0i32; num_io * 2];
        let mut d_indices = vec![-1i32; num_io];

        for l in 0..num_layers {
            let horizon = layer_descs[l].temporal_horizon;

            let mut e_vlds: Vec<EncoderVld>;
            let mut layer_histories: Vec<CircleBuffer<IntBuffer>>;

            if l == 0 {
                // one visible layer per (channel, history slot)
                e_vlds = Vec::with_capacity(num_io * horizon);

                for i in 0..num_io {
                    for _ in 0..horizon {
                        e_vlds.push(EncoderVld {
                            size: io_sizes[i],
                            radius: io_descs[i].up_radius,
                        });
                    }
                }

                layer_histories = Vec::with_capacity(num_io);

                for i in 0..num_io {
                    let mut ring = CircleBuffer::new(horizon);
                    for t in 0..horizon {
                        *ring.get_mut(t) = vec![0i32; io_sizes[i].num_columns()];
                    }
                    layer_histories.push(ring);
                }

                let mut layer_decoders = Vec::with_capacity(num_predictions);
                let mut d_index = 0usize;

                for i in 0..num_io {
                    if io_types[i] == IoType::Prediction {
                        let num_d_vl = 1 + (l < num_layers - 1) as usize;
                        let mut d_vlds: Vec<DecoderVld> = Vec::with_capacity(num_d_vl);
                        d_vlds.push(DecoderVld {
                            size: layer_descs[l].hidden_size,
                            radius: io_descs[i].down_radius,
                        });
                        if l < num_layers - 1 {
                            d_vlds.push(d_vlds[0].clone());
                        }

                        layer_decoders.push(Decoder::new(io_sizes[i], d_vlds, &mut rng)?);

                        i_indices[d_index] = i as i32;
                        d_indices[i] = d_index as i32;
                        d_index += 1;
                    }
                }

                let mut a_index = 0usize;

                for i in 0..num_io {
                    if io_types[i] == IoType::Action {
                        let num_a_vl = 1 + (l < num_layers - 1) as usize;
                        let mut a_vlds: Vec<ActorVld> = Vec::with_capacity(num_a_vl);
                        a_vlds.push(ActorVld {
                            size: layer_descs[l].hidden_size,
                            radius: io_descs[i].down_radius,
                        });
                        if l < num_layers - 1 {
                            a_vlds.push(a_vlds[0].clone());
                        }

                        actors.push(Actor::new(
                            io_sizes[i],
                            io_descs[i].history_capacity,
                            a_vlds,
                            &mut rng,
                        )?);

                        i_indices[num_io + a_index] = i as i32;
                        d_indices[i] = a_index as i32;
                        a_index += 1;
                    }
                }

                decoders.push(layer_decoders);
            } else {
                // one visible layer per history slot over the layer below
                e_vlds = Vec::with_capacity(horizon);

                for _ in 0..horizon {
                    e_vlds.push(EncoderVld {
                        size: layer_descs[l - 1].hidden_size,
                        radius: layer_descs[l].up_radius,
                    });
                }

                let below_columns = layer_descs[l - 1].hidden_size.num_columns();

                let mut ring = CircleBuffer::new(horizon);
                for t in 0..horizon {
                    *ring.get_mut(t) = vec![0i32; below_columns];
                }
                layer_histories = vec![ring];

                // one decoder per tick phase, each predicting the layer below
                let num_d_vl = 1 + (l < num_layers - 1) as usize;
                let mut d_vlds: Vec<DecoderVld> = Vec::with_capacity(num_d_vl);
                d_vlds.push(DecoderVld {
                    size: layer_descs[l].hidden_size,
                    radius: layer_descs[l].down_radius,
                });
                if l < num_layers - 1 {
                    d_vlds.push(d_vlds[0].clone());
                }

                let mut layer_decoders = Vec::with_capacity(ticks_per_update[l]);
                for _ in 0..ticks_per_update[l] {
                    layer_decoders.push(Decoder::new(
                        layer_descs[l - 1].hidden_size,
                        d_vlds.clone(),
                        &mut rng,
                    )?);
                }
                decoders.push(layer_decoders);
            }

            encoders.push(Encoder::new(layer_descs[l].hidden_size, e_vlds, &mut rng)?);
            histories.push(layer_histories);
        }

        debug!(
            "initialized hierarchy: {num_layers} layers, {num_io} io channels \
             ({num_predictions} predictions, {num_actions} actions)"
        );

        Ok(Self {
            encoders,
            decoders,
            actors,
            i_indices,
            d_indices,
            histories,
            updates: vec![false; num_layers],
            ticks: vec![0; num_layers],
            ticks_per_update,
            io_sizes,
            io_types,
            rng,
            params: Params {
                layers: vec![LayerParams::default(); num_layers],
                ios: vec![IoParams::default(); num_io],
            },
        })
    }

    /// Run one timestep.
    ///
    /// `input_cis` carries one column-index field per IO channel, in
    /// descriptor order. `reward` and `mimic` are forwarded to all actors.
    pub fn step(
        &mut self,
        input_cis: &[&[i32]],
        learn_enabled: bool,
        reward: f32,
        mimic: f32,
    ) -> Result<()> {
        let num_layers = self.encoders.len();
        let num_io = self.io_sizes.len();

        if input_cis.len() != num_io {
            return Err(Error::ShapeMismatch(format!(
                "expected {num_io} input buffers, got {}",
                input_cis.len()
            )));
        }
        for i in 0..num_io {
            let expected = self.io_sizes[i].num_columns();
            if input_cis[i].len() != expected {
                return Err(Error::ShapeMismatch(format!(
                    "input buffer {i} has {} columns, expected {expected}",
                    input_cis[i].len()
                )));
            }
        }

        // importances may have been changed through params
        for i in 0..num_io {
            let horizon = self.histories[0][i].len();
            for t in 0..horizon {
                self.encoders[0].visible_layers[i * horizon + t].importance =
                    self.params.ios[i].importance;
            }
        }

        self.ticks[0] = 0;

        // remember the new inputs
        for i in 0..num_io {
            self.histories[0][i].push_front();
            self.histories[0][i].front_mut().copy_from_slice(input_cis[i]);
        }

        for u in self.updates.iter_mut() {
            *u = false;
        }

        // ascending pass
        for l in 0..num_layers {
            if l == 0 || self.ticks[l] >= self.ticks_per_update[l] {
                self.ticks[l] = 0;
                self.updates[l] = true;

                // flatten the history rings channel-major, time-minor
                let layer_inputs: Vec<&[i32]> = self.histories[l]
                    .iter()
                    .flat_map(|ring| (0..ring.len()).map(move |t| ring.get(t).as_slice()))
                    .collect();

                let enc_params = self.params.layers[l].encoder.clone();
                self.encoders[l].step(&layer_inputs, learn_enabled, &enc_params, &mut self.rng);

                if l < num_layers - 1 {
                    let hidden_cis = self.encoders[l].get_hidden_cis().to_vec();

                    self.histories[l + 1][0].push_front();
                    self.histories[l + 1][0].front_mut().copy_from_slice(&hidden_cis);

                    self.ticks[l + 1] += 1;
                }
            }
        }

        trace!("step updates: {:?}", self.updates);

        // descending pass
        for l in (0..num_layers).rev() {
            if !self.updates[l] {
                continue;
            }

            let mut layer_inputs_owned: Vec<Vec<i32>> = Vec::with_capacity(2);
            layer_inputs_owned.push(self.encoders[l].get_hidden_cis().to_vec());

            if l < num_layers - 1 {
                // the tick-phased decoder of the layer above feeds back down
                let phase = self.ticks_per_update[l + 1] - 1 - self.ticks[l + 1];
                layer_inputs_owned.push(self.decoders[l + 1][phase].get_hidden_cis().to_vec());
            }

            let layer_inputs: Vec<&[i32]> =
                layer_inputs_owned.iter().map(|v| v.as_slice()).collect();

            for d in 0..self.decoders[l].len() {
                let (target, dec_params) = if l == 0 {
                    let i_idx = self.i_indices[d] as usize;
                    (
                        self.histories[0][i_idx].get(0).as_slice(),
                        self.params.ios[i_idx].decoder.clone(),
                    )
                } else {
                    (
                        self.histories[l][0].get(d).as_slice(),
                        self.params.layers[l].decoder.clone(),
                    )
                };

                self.decoders[l][d].step(
                    &layer_inputs,
                    target,
                    learn_enabled,
                    &dec_params,
                    &mut self.rng,
                );
            }

            if l == 0 {
                for d in 0..self.actors.len() {
                    let i_idx = self.i_indices[num_io + d] as usize;
                    let actor_params = self.params.ios[i_idx].actor.clone();

                    self.actors[d].step(
                        &layer_inputs,
                        input_cis[i_idx],
                        learn_enabled,
                        reward,
                        mimic,
                        &actor_params,
                        &mut self.rng,
                    );
                }
            }
        }

        Ok(())
    }

    /// Zero all transient state (histories, ticks, per-component state).
    /// Weights are untouched.
    pub fn clear_state(&mut self) {
        for u in self.updates.iter_mut() {
            *u = false;
        }
        self.ticks.fill(0);

        for layer_histories in &mut self.histories {
            for ring in layer_histories.iter_mut() {
                for t in 0..ring.len() {
                    ring.get_mut(t).fill(0);
                }
            }
        }

        for encoder in &mut self.encoders {
            encoder.clear_state();
        }

        for layer_decoders in &mut self.decoders {
            for decoder in layer_decoders.iter_mut() {
                decoder.clear_state();
            }
        }

        for actor in &mut self.actors {
            actor.clear_state();
        }

        debug!("cleared hierarchy state");
    }

    /// Whether channel `i` has a decoder or actor attached.
    pub fn io_layer_exists(&self, i: usize) -> bool {
        self.d_indices[i] != -1
    }

    /// Predicted (or selected, for action channels) column indices for
    /// channel `i`.
    pub fn get_prediction_cis(&self, i: usize) -> Result<&[i32]> {
        if i >= self.io_sizes.len() {
            return Err(Error::ShapeMismatch(format!(
                "channel index {i} out of range ({} channels)",
                self.io_sizes.len()
            )));
        }
        if self.d_indices[i] == -1 {
            return Err(Error::ChannelUnused(i));
        }

        Ok(match self.io_types[i] {
            IoType::Action => self.actors[self.d_indices[i] as usize].get_hidden_cis(),
            _ => self.decoders[0][self.d_indices[i] as usize].get_hidden_cis(),
        })
    }

    /// Softmax activations behind `get_prediction_cis`.
    pub fn get_prediction_acts(&self, i: usize) -> Result<&[f32]> {
        if i >= self.io_sizes.len() {
            return Err(Error::ShapeMismatch(format!(
                "channel index {i} out of range ({} channels)",
                self.io_sizes.len()
            )));
        }
        if self.d_indices[i] == -1 {
            return Err(Error::ChannelUnused(i));
        }

        Ok(match self.io_types[i] {
            IoType::Action => self.actors[self.d_indices[i] as usize].get_hidden_acts(),
            _ => self.decoders[0][self.d_indices[i] as usize].get_hidden_acts(),
        })
    }

    /// Value-head output of the actor on action channel `i`.
    pub fn get_prediction_values(&self, i: usize) -> Result<&[f32]> {
        if i >= self.io_sizes.len() || self.io_types[i] != IoType::Action
            || self.d_indices[i] == -1
        {
            return Err(Error::ChannelUnused(i));
        }

        Ok(self.actors[self.d_indices[i] as usize].get_hidden_values())
    }

    /// Set the layer-0 encoder weighting of channel `i`'s input.
    pub fn set_input_importance(&mut self, i: usize, importance: f32) {
        self.params.ios[i].importance = importance;
    }

    pub fn get_num_layers(&self) -> usize {
        self.encoders.len()
    }

    pub fn get_num_io(&self) -> usize {
        self.io_sizes.len()
    }

    pub fn get_io_size(&self, i: usize) -> Int3 {
        self.io_sizes[i]
    }

    pub fn get_io_type(&self, i: usize) -> IoType {
        self.io_types[i]
    }

    /// Whether layer `l` ran its encoder on the last step.
    pub fn get_update(&self, l: usize) -> bool {
        self.updates[l]
    }

    pub fn get_ticks(&self, l: usize) -> usize {
        self.ticks[l]
    }

    pub fn get_ticks_per_update(&self, l: usize) -> usize {
        self.ticks_per_update[l]
    }

    pub fn get_encoder(&self, l: usize) -> &Encoder {
        &self.encoders[l]
    }

    pub fn get_encoder_mut(&mut self, l: usize) -> &mut Encoder {
        &mut self.encoders[l]
    }

    /// Decoder serving channel `i` at layer 0, or phase decoder `i` above.
    pub fn get_decoder(&self, l: usize, i: usize) -> &Decoder {
        if l == 0 {
            &self.decoders[l][self.d_indices[i] as usize]
        } else {
            &self.decoders[l][i]
        }
    }

    pub fn get_decoder_mut(&mut self, l: usize, i: usize) -> &mut Decoder {
        if l == 0 {
            let d = self.d_indices[i] as usize;
            &mut self.decoders[l][d]
        } else {
            &mut self.decoders[l][i]
        }
    }

    pub fn get_actor(&self, i: usize) -> &Actor {
        &self.actors[self.d_indices[i] as usize]
    }

    pub fn get_actor_mut(&mut self, i: usize) -> &mut Actor {
        let d = self.d_indices[i] as usize;
        &mut self.actors[d]
    }

    // Serialization

    /// Exact byte count of a `write` dump.
    pub fn size(&self) -> usize {
        let num_layers = self.encoders.len();
        let num_io = self.io_sizes.len();

        let mut size = 4 * 4
            + num_io * 3 * 4
            + num_io
            + num_layers
            + 2 * num_layers * 4
            + 2 * num_io * 4
            + num_io * 4;

        for l in 0..num_layers {
            size += 4;

            for ring in &self.histories[l] {
                size += 2 * 4;

                for t in 0..ring.len() {
                    size += 4 + ring.get(t).len() * 4;
                }
            }

            size += self.encoders[l].size();

            for decoder in &self.decoders[l] {
                size += decoder.size();
            }
        }

        for actor in &self.actors {
            size += actor.size();
        }

        // params
        size += num_layers * 6 * 4;
        size += num_io * 9 * 4;

        // rng state
        size + 8
    }

    /// Exact byte count of a `write_state` dump.
    pub fn state_size(&self) -> usize {
        let num_layers = self.encoders.len();

        let mut size = num_layers + num_layers * 4;

        for l in 0..num_layers {
            for ring in &self.histories[l] {
                size += 4;

                for t in 0..ring.len() {
                    size += ring.get(t).len() * 4;
                }
            }

            size += self.encoders[l].state_size();

            for decoder in &self.decoders[l] {
                size += decoder.state_size();
            }
        }

        for actor in &self.actors {
            size += actor.state_size();
        }

        // rng state
        size + 8
    }

    /// Serialize everything: structure, weights, state, params, RNG.
    pub fn write(&self, writer: &mut dyn StreamWriter) {
        let num_layers = self.encoders.len();
        let num_io = self.io_sizes.len();

        writer.write_i32(num_layers as i32);
        writer.write_i32(num_io as i32);
        writer.write_i32(self.decoders[0].len() as i32);
        writer.write_i32(self.actors.len() as i32);

        for &size in &self.io_sizes {
            writer.write_int3(size);
        }
        for &io_type in &self.io_types {
            writer.write_u8(io_type as u8);
        }

        for &u in &self.updates {
            writer.write_u8(u as u8);
        }
        for &t in &self.ticks {
            writer.write_i32(t as i32);
        }
        for &tpu in &self.ticks_per_update {
            writer.write_i32(tpu as i32);
        }

        writer.write_i32_slice(&self.i_indices);
        writer.write_i32_slice(&self.d_indices);

        for l in 0..num_layers {
            writer.write_i32(self.histories[l].len() as i32);

            for ring in &self.histories[l] {
                writer.write_i32(ring.len() as i32);
                writer.write_i32(ring.start() as i32);

                for t in 0..ring.len() {
                    writer.write_i32(ring.get(t).len() as i32);
                    writer.write_i32_slice(ring.get(t));
                }
            }

            self.encoders[l].write(writer);

            for decoder in &self.decoders[l] {
                decoder.write(writer);
            }
        }

        for actor in &self.actors {
            actor.write(writer);
        }

        for lp in &self.params.layers {
            writer.write_f32(lp.encoder.scale);
            writer.write_f32(lp.encoder.lr);
            writer.write_f32(lp.encoder.gcurve);
            writer.write_f32(lp.decoder.scale);
            writer.write_f32(lp.decoder.lr);
            writer.write_f32(lp.decoder.gcurve);
        }

        for ip in &self.params.ios {
            writer.write_f32(ip.decoder.scale);
            writer.write_f32(ip.decoder.lr);
            writer.write_f32(ip.decoder.gcurve);
            writer.write_f32(ip.actor.vlr);
            writer.write_f32(ip.actor.alr);
            writer.write_f32(ip.actor.discount);
            writer.write_i32(ip.actor.min_steps as i32);
            writer.write_i32(ip.actor.history_iters as i32);
            writer.write_f32(ip.importance);
        }

        writer.write_u64(self.rng.state());
    }

    /// Reconstitute a hierarchy from a `write` dump.
    pub fn read(reader: &mut dyn StreamReader) -> Result<Self> {
        let num_layers = reader.read_i32()? as usize;
        let num_io = reader.read_i32()? as usize;
        let num_predictions = reader.read_i32()? as usize;
        let num_actions = reader.read_i32()? as usize;

        if num_layers == 0 || num_io == 0 {
            return Err(Error::Serialization(
                "dump declares an empty hierarchy".into(),
            ));
        }

        let mut io_sizes = Vec::with_capacity(num_io);
        for _ in 0..num_io {
            io_sizes.push(reader.read_int3()?);
        }

        let mut io_types = Vec::with_capacity(num_io);
        for _ in 0..num_io {
            io_types.push(IoType::from(reader.read_u8()?));
        }

        let mut updates = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            updates.push(reader.read_u8()? != 0);
        }

        let mut ticks = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            ticks.push(reader.read_i32()? as usize);
        }

        let mut ticks_per_update = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            ticks_per_update.push(reader.read_i32()? as usize);
        }

        let mut i_indices = vec![0i32; num_io * 2];
        reader.read_i32_slice(&mut i_indices)?;

        let mut d_indices = vec![0i32; num_io];
        reader.read_i32_slice(&mut d_indices)?;

        let mut encoders = Vec::with_capacity(num_layers);
        let mut decoders = Vec::with_capacity(num_layers);
        let mut histories = Vec::with_capacity(num_layers);

        for l in 0..num_layers {
            let num_channels = reader.read_i32()? as usize;
            let mut layer_histories = Vec::with_capacity(num_channels);

            for _ in 0..num_channels {
                let history_len = reader.read_i32()? as usize;
                let history_start = reader.read_i32()? as usize;

                let mut ring = CircleBuffer::new(history_len);
                ring.set_start(history_start);

                for t in 0..history_len {
                    let buffer_len = reader.read_i32()? as usize;
                    let mut buffer = vec![0i32; buffer_len];
                    reader.read_i32_slice(&mut buffer)?;
                    *ring.get_mut(t) = buffer;
                }

                layer_histories.push(ring);
            }

            histories.push(layer_histories);
            encoders.push(Encoder::read(reader)?);

            let num_decoders = if l == 0 {
                num_predictions
            } else {
                ticks_per_update[l]
            };

            let mut layer_decoders = Vec::with_capacity(num_decoders);
            for _ in 0..num_decoders {
                layer_decoders.push(Decoder::read(reader)?);
            }
            decoders.push(layer_decoders);
        }

        let mut actors = Vec::with_capacity(num_actions);
        for _ in 0..num_actions {
            actors.push(Actor::read(reader)?);
        }

        let mut layer_params = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            layer_params.push(LayerParams {
                encoder: EncoderParams {
                    scale: reader.read_f32()?,
                    lr: reader.read_f32()?,
                    gcurve: reader.read_f32()?,
                },
                decoder: DecoderParams {
                    scale: reader.read_f32()?,
                    lr: reader.read_f32()?,
                    gcurve: reader.read_f32()?,
                },
            });
        }

        let mut io_params = Vec::with_capacity(num_io);
        for _ in 0..num_io {
            io_params.push(IoParams {
                decoder: DecoderParams {
                    scale: reader.read_f32()?,
                    lr: reader.read_f32()?,
                    gcurve: reader.read_f32()?,
                },
                actor: ActorParams {
                    vlr: reader.read_f32()?,
                    alr: reader.read_f32()?,
                    discount: reader.read_f32()?,
                    min_steps: reader.read_i32()? as usize,
                    history_iters: reader.read_i32()? as usize,
                },
                importance: reader.read_f32()?,
            });
        }

        let mut rng = Rng::new(0);
        rng.set_state(reader.read_u64()?);

        debug!(
            "restored hierarchy: {num_layers} layers, {num_io} io channels \
             ({num_predictions} predictions, {num_actions} actions)"
        );

        Ok(Self {
            encoders,
            decoders,
            actors,
            i_indices,
            d_indices,
            histories,
            updates,
            ticks,
            ticks_per_update,
            io_sizes,
            io_types,
            rng,
            params: Params {
                layers: layer_params,
                ios: io_params,
            },
        })
    }

    /// Serialize only the transient state. Shapes must already match when
    /// reading it back.
    pub fn write_state(&self, writer: &mut dyn StreamWriter) {
        for &u in &self.updates {
            writer.write_u8(u as u8);
        }
        for &t in &self.ticks {
            writer.write_i32(t as i32);
        }

        for l in 0..self.encoders.len() {
            for ring in &self.histories[l] {
                writer.write_i32(ring.start() as i32);

                for t in 0..ring.len() {
                    writer.write_i32_slice(ring.get(t));
                }
            }

            self.encoders[l].write_state(writer);

            for decoder in &self.decoders[l] {
                decoder.write_state(writer);
            }
        }

        for actor in &self.actors {
            actor.write_state(writer);
        }

        writer.write_u64(self.rng.state());
    }

    /// Restore transient state written by `write_state`.
    pub fn read_state(&mut self, reader: &mut dyn StreamReader) -> Result<()> {
        for u in self.updates.iter_mut() {
            *u = reader.read_u8()? != 0;
        }
        for t in self.ticks.iter_mut() {
            *t = reader.read_i32()? as usize;
        }

        for l in 0..self.encoders.len() {
            for ring in self.histories[l].iter_mut() {
                let start = reader.read_i32()? as usize;
                ring.set_start(start);

                for t in 0..ring.len() {
                    let len = ring.get(t).len();
                    let mut buffer = vec![0i32; len];
                    reader.read_i32_slice(&mut buffer)?;
                    *ring.get_mut(t) = buffer;
                }
            }

            self.encoders[l].read_state(reader)?;

            for decoder in self.decoders[l].iter_mut() {
                decoder.read_state(reader)?;
            }
        }

        for actor in &mut self.actors {
            actor.read_state(reader)?;
        }

        let state = reader.read_u64()?;
        self.rng.set_state(state);

        Ok(())
    }
}
