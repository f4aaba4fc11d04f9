use sph::helpers::Int3;
use sph::hierarchy::{Hierarchy, IoDesc, IoType, LayerDesc};
use sph::Error;

fn make_cis(size: Int3) -> Vec<i32> {
    let cols = (size.x * size.y) as usize;
    let col_size = size.z as usize;
    (0..cols).map(|i| (i % col_size) as i32).collect()
}

fn prediction_io(size: Int3) -> IoDesc {
    IoDesc {
        size,
        io_type: IoType::Prediction,
        ..Default::default()
    }
}

fn layer(hidden_size: Int3) -> LayerDesc {
    LayerDesc {
        hidden_size,
        ..Default::default()
    }
}

// Every weight tensor in the hierarchy, flattened for freeze checks.
fn weight_snapshot(h: &Hierarchy) -> (Vec<u8>, Vec<f32>) {
    let mut bytes = Vec::new();
    let mut floats = Vec::new();

    for l in 0..h.get_num_layers() {
        let enc = h.get_encoder(l);
        for v in 0..enc.get_num_visible_layers() {
            bytes.extend_from_slice(&enc.get_visible_layer(v).weights);
        }
    }

    for i in 0..h.get_num_io() {
        match h.get_io_type(i) {
            IoType::Prediction => {
                let dec = h.get_decoder(0, i);
                for v in 0..dec.get_num_visible_layers() {
                    bytes.extend_from_slice(&dec.get_visible_layer(v).weights);
                }
            }
            IoType::Action => {
                let actor = h.get_actor(i);
                for v in 0..actor.get_num_visible_layers() {
                    floats.extend_from_slice(&actor.get_visible_layer(v).value_weights);
                    floats.extend_from_slice(&actor.get_visible_layer(v).action_weights);
                }
            }
            IoType::None => {}
        }
    }

    for l in 1..h.get_num_layers() {
        for d in 0..h.get_ticks_per_update(l) {
            let dec = h.get_decoder(l, d);
            for v in 0..dec.get_num_visible_layers() {
                bytes.extend_from_slice(&dec.get_visible_layer(v).weights);
            }
        }
    }

    (bytes, floats)
}

#[test]
fn test_create_and_step() {
    let io_descs = vec![prediction_io(Int3::new(4, 4, 16))];
    let layer_descs = vec![layer(Int3::new(4, 4, 16))];

    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    assert_eq!(h.get_num_layers(), 1);
    assert_eq!(h.get_num_io(), 1);
    assert_eq!(h.get_io_type(0), IoType::Prediction);
    assert!(h.io_layer_exists(0));

    let input_cis = make_cis(h.get_io_size(0));

    for _ in 0..3 {
        h.step(&[&input_cis], true, 0.0, 0.0).unwrap();
    }

    let pred_cis = h.get_prediction_cis(0).unwrap();
    let io_size = h.get_io_size(0);
    assert_eq!(pred_cis.len(), (io_size.x * io_size.y) as usize);

    for &ci in pred_cis {
        assert!(ci >= 0 && ci < io_size.z, "ci={ci} out of range [0,{})", io_size.z);
    }

    let pred_acts = h.get_prediction_acts(0).unwrap();
    assert_eq!(pred_acts.len(), io_size.num_cells());
}

#[test]
fn test_tick_schedule() {
    let io_descs = vec![prediction_io(Int3::new(4, 4, 8))];
    let layer_descs = vec![
        layer(Int3::new(4, 4, 16)),
        layer(Int3::new(4, 4, 16)),
        layer(Int3::new(3, 3, 16)),
    ];

    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    assert_eq!(h.get_ticks_per_update(0), 1);
    assert_eq!(h.get_ticks_per_update(1), 2);
    assert_eq!(h.get_ticks_per_update(2), 2);

    let input_cis = make_cis(h.get_io_size(0));

    for step in 1..=16usize {
        h.step(&[&input_cis], true, 0.0, 0.0).unwrap();

        // the bottom layer runs every step
        assert!(h.get_update(0));
        assert_eq!(h.get_ticks(0), 0);

        for l in 1..h.get_num_layers() {
            assert!(h.get_ticks(l) <= h.get_ticks_per_update(l));
        }

        // layer 1 ticks every 2 steps, layer 2 every 4
        assert_eq!(h.get_update(1), step % 2 == 0);
        assert_eq!(h.get_update(2), step % 4 == 0);
    }
}

#[test]
fn test_hidden_cis_in_range() {
    let io_descs = vec![prediction_io(Int3::new(4, 4, 8))];
    let layer_descs = vec![layer(Int3::new(4, 4, 16)), layer(Int3::new(3, 3, 12))];

    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    let input_cis = make_cis(h.get_io_size(0));

    for _ in 0..10 {
        h.step(&[&input_cis], true, 0.0, 0.0).unwrap();

        for l in 0..h.get_num_layers() {
            let enc = h.get_encoder(l);
            let size = enc.get_hidden_size();

            assert_eq!(enc.get_hidden_cis().len(), size.num_columns());

            for &ci in enc.get_hidden_cis() {
                assert!(ci >= 0 && ci < size.z);
            }
        }
    }
}

#[test]
fn test_multiple_io() {
    let io_descs = vec![
        prediction_io(Int3::new(4, 4, 8)),
        prediction_io(Int3::new(3, 3, 8)),
    ];
    let layer_descs = vec![layer(Int3::new(4, 4, 16))];

    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    assert_eq!(h.get_num_io(), 2);

    let input0 = make_cis(h.get_io_size(0));
    let input1 = make_cis(h.get_io_size(1));

    for _ in 0..3 {
        h.step(&[&input0, &input1], true, 0.0, 0.0).unwrap();
    }

    for i in 0..2 {
        let pred = h.get_prediction_cis(i).unwrap();
        let io_size = h.get_io_size(i);
        assert_eq!(pred.len(), (io_size.x * io_size.y) as usize);
        for &ci in pred {
            assert!(ci >= 0 && ci < io_size.z);
        }
    }
}

#[test]
fn test_clear_state() {
    let io_descs = vec![prediction_io(Int3::new(4, 4, 8))];
    let layer_descs = vec![layer(Int3::new(4, 4, 8))];

    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    let input_cis = make_cis(h.get_io_size(0));

    for _ in 0..5 {
        h.step(&[&input_cis], true, 0.0, 0.0).unwrap();
    }

    h.clear_state();

    assert!(h.get_encoder(0).get_hidden_cis().iter().all(|&ci| ci == 0));
    assert_eq!(h.get_ticks(0), 0);
    assert!(!h.get_update(0));

    // stepping still works afterwards
    h.step(&[&input_cis], true, 0.0, 0.0).unwrap();
    assert!(h.get_update(0));
}

#[test]
fn test_shape_mismatch() {
    let io_descs = vec![prediction_io(Int3::new(4, 4, 8))];
    let layer_descs = vec![layer(Int3::new(4, 4, 8))];

    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    let good = make_cis(h.get_io_size(0));
    let short = vec![0i32; 3];

    assert!(matches!(
        h.step(&[&good, &good], true, 0.0, 0.0),
        Err(Error::ShapeMismatch(_))
    ));
    assert!(matches!(
        h.step(&[&short], true, 0.0, 0.0),
        Err(Error::ShapeMismatch(_))
    ));

    // a failed step must not poison the hierarchy
    h.step(&[&good], true, 0.0, 0.0).unwrap();
}

#[test]
fn test_configuration_errors() {
    let io = prediction_io(Int3::new(4, 4, 8));
    let ld = layer(Int3::new(4, 4, 8));

    assert!(matches!(
        Hierarchy::new(&[], &[ld.clone()], 1337),
        Err(Error::Configuration(_))
    ));
    assert!(matches!(
        Hierarchy::new(&[io.clone()], &[], 1337),
        Err(Error::Configuration(_))
    ));

    let zero_dim = prediction_io(Int3::new(0, 4, 8));
    assert!(matches!(
        Hierarchy::new(&[zero_dim], &[ld.clone()], 1337),
        Err(Error::Configuration(_))
    ));

    let negative_radius = IoDesc {
        up_radius: -1,
        ..prediction_io(Int3::new(4, 4, 8))
    };
    assert!(matches!(
        Hierarchy::new(&[negative_radius], &[ld.clone()], 1337),
        Err(Error::Configuration(_))
    ));

    let bad_schedule = LayerDesc {
        ticks_per_update: 3,
        temporal_horizon: 2,
        ..layer(Int3::new(4, 4, 8))
    };
    assert!(matches!(
        Hierarchy::new(&[io.clone()], &[ld.clone(), bad_schedule], 1337),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn test_channel_unused() {
    let io_descs = vec![
        IoDesc {
            io_type: IoType::None,
            ..prediction_io(Int3::new(4, 4, 8))
        },
        prediction_io(Int3::new(4, 4, 8)),
    ];
    let layer_descs = vec![layer(Int3::new(4, 4, 8))];

    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    assert!(!h.io_layer_exists(0));
    assert!(h.io_layer_exists(1));

    let input = make_cis(h.get_io_size(0));
    h.step(&[&input, &input], true, 0.0, 0.0).unwrap();

    assert!(matches!(h.get_prediction_cis(0), Err(Error::ChannelUnused(0))));
    assert!(matches!(h.get_prediction_acts(0), Err(Error::ChannelUnused(0))));
    assert!(h.get_prediction_cis(1).is_ok());

    // value readout only exists for action channels
    assert!(h.get_prediction_values(1).is_err());
}

#[test]
fn test_learn_disabled_freezes_weights() {
    let io_descs = vec![
        prediction_io(Int3::new(4, 4, 8)),
        IoDesc {
            io_type: IoType::Action,
            history_capacity: 32,
            ..prediction_io(Int3::new(1, 1, 2))
        },
    ];
    let layer_descs = vec![layer(Int3::new(4, 4, 16)), layer(Int3::new(3, 3, 16))];

    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    let input0 = make_cis(h.get_io_size(0));
    let input1 = vec![0i32];

    // warm up with learning so weights are away from init
    for _ in 0..20 {
        h.step(&[&input0, &input1], true, 1.0, 0.0).unwrap();
    }

    let (bytes_before, floats_before) = weight_snapshot(&h);

    for _ in 0..20 {
        h.step(&[&input0, &input1], false, 1.0, 0.0).unwrap();
    }

    let (bytes_after, floats_after) = weight_snapshot(&h);

    assert_eq!(bytes_before, bytes_after);
    assert_eq!(floats_before, floats_after);
}

#[test]
fn test_byte_weights_saturate() {
    let io_descs = vec![prediction_io(Int3::new(2, 2, 4))];
    let layer_descs = vec![layer(Int3::new(2, 2, 8))];

    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    // hammer one constant pattern so winning weights run into the byte rails
    let input_cis = vec![1i32; 4];

    for _ in 0..2000 {
        h.step(&[&input_cis], true, 0.0, 0.0).unwrap();
    }

    // u8 storage cannot leave [0, 255]; make sure learning actually moved
    // weights instead of silently doing nothing
    let enc = h.get_encoder(0);
    let mut any_high = false;
    for v in 0..enc.get_num_visible_layers() {
        if enc.get_visible_layer(v).weights.iter().any(|&w| w > 128) {
            any_high = true;
        }
    }
    assert!(any_high, "encoder weights never moved off their small init");
}
