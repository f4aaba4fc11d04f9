use sph::helpers::{Int3, SliceReader};
use sph::hierarchy::{Hierarchy, IoDesc, IoType, LayerDesc};
use sph::Error;

fn bandit_descs() -> (Vec<IoDesc>, Vec<LayerDesc>) {
    let io_descs = vec![
        IoDesc {
            size: Int3::new(1, 4, 32),
            io_type: IoType::Prediction,
            ..Default::default()
        },
        IoDesc {
            size: Int3::new(1, 1, 2),
            io_type: IoType::Action,
            ..Default::default()
        },
    ];
    let layer_descs = vec![LayerDesc::default(), LayerDesc::default()];

    (io_descs, layer_descs)
}

fn sequence_descs() -> (Vec<IoDesc>, Vec<LayerDesc>) {
    let io_descs = vec![IoDesc {
        size: Int3::new(1, 1, 4),
        io_type: IoType::Prediction,
        ..Default::default()
    }];
    let layer_descs = vec![LayerDesc::default(), LayerDesc::default()];

    (io_descs, layer_descs)
}

#[test]
fn test_size_matches_write() {
    let (io_descs, layer_descs) = bandit_descs();
    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    let mut dump: Vec<u8> = Vec::new();
    h.write(&mut dump);
    assert_eq!(h.size(), dump.len());

    let mut state_dump: Vec<u8> = Vec::new();
    h.write_state(&mut state_dump);
    assert_eq!(h.state_size(), state_dump.len());

    // sizes stay exact after the buffers have seen real traffic
    let input0 = vec![0i32; 4];
    let input1 = vec![0i32; 1];
    for _ in 0..10 {
        h.step(&[&input0, &input1], true, 0.0, 0.0).unwrap();
    }

    let mut dump: Vec<u8> = Vec::new();
    h.write(&mut dump);
    assert_eq!(h.size(), dump.len());

    let mut state_dump: Vec<u8> = Vec::new();
    h.write_state(&mut state_dump);
    assert_eq!(h.state_size(), state_dump.len());
}

#[test]
fn test_write_read_write_is_identical() {
    let (io_descs, layer_descs) = sequence_descs();
    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    let inputs = [2i32, 3i32];
    for step in 0..100usize {
        let input = vec![inputs[step % 2]];
        h.step(&[&input], true, 0.0, 0.0).unwrap();
    }

    let mut dump: Vec<u8> = Vec::new();
    h.write(&mut dump);

    let mut reader = SliceReader::new(&dump);
    let restored = Hierarchy::read(&mut reader).unwrap();
    assert_eq!(reader.remaining(), 0);

    let mut dump2: Vec<u8> = Vec::new();
    restored.write(&mut dump2);

    assert_eq!(dump, dump2);
}

// Restore mid-run, then drive the original and the restored copy in
// lockstep: every output must match on every subsequent step.
#[test]
fn test_full_round_trip_continues_identically() {
    let (io_descs, layer_descs) = sequence_descs();
    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    let inputs = [2i32, 3i32];
    for step in 0..500usize {
        let input = vec![inputs[step % 2]];
        h.step(&[&input], true, 0.0, 0.0).unwrap();
    }

    let mut dump: Vec<u8> = Vec::new();
    h.write(&mut dump);

    let mut reader = SliceReader::new(&dump);
    let mut restored = Hierarchy::read(&mut reader).unwrap();

    for step in 500..550usize {
        let input = vec![inputs[step % 2]];
        h.step(&[&input], true, 0.0, 0.0).unwrap();
        restored.step(&[&input], true, 0.0, 0.0).unwrap();

        assert_eq!(
            h.get_prediction_cis(0).unwrap(),
            restored.get_prediction_cis(0).unwrap(),
            "predictions diverged at step {step}"
        );
        assert_eq!(
            h.get_prediction_acts(0).unwrap(),
            restored.get_prediction_acts(0).unwrap()
        );

        for l in 0..h.get_num_layers() {
            assert_eq!(
                h.get_encoder(l).get_hidden_cis(),
                restored.get_encoder(l).get_hidden_cis(),
                "hidden codes diverged at layer {l}, step {step}"
            );
        }
    }
}

// Same lockstep check through an actor, whose sampling draws on the
// serialized RNG state.
#[test]
fn test_actor_round_trip_continues_identically() {
    let (io_descs, layer_descs) = bandit_descs();
    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    let input0 = vec![0i32; 4];

    let mut prev_action = 0i32;
    for _ in 0..50usize {
        let input1 = vec![prev_action];
        h.step(&[&input0, &input1], true, 0.5, 0.0).unwrap();
        prev_action = h.get_prediction_cis(1).unwrap()[0];
    }

    let mut dump: Vec<u8> = Vec::new();
    h.write(&mut dump);

    let mut reader = SliceReader::new(&dump);
    let mut restored = Hierarchy::read(&mut reader).unwrap();

    for step in 0..30usize {
        let input1 = vec![prev_action];
        h.step(&[&input0, &input1], true, 0.5, 0.0).unwrap();
        restored.step(&[&input0, &input1], true, 0.5, 0.0).unwrap();

        assert_eq!(
            h.get_prediction_cis(1).unwrap(),
            restored.get_prediction_cis(1).unwrap(),
            "sampled actions diverged at step {step}"
        );

        prev_action = h.get_prediction_cis(1).unwrap()[0];
    }
}

#[test]
fn test_state_round_trip() {
    let (io_descs, layer_descs) = sequence_descs();
    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    // twin shares weights but will be desynced, then resynced via state
    let mut twin = h.clone();

    let inputs = [2i32, 3i32];
    for step in 0..100usize {
        let input = vec![inputs[step % 2]];
        h.step(&[&input], false, 0.0, 0.0).unwrap();
    }

    twin.clear_state();

    let mut state_dump: Vec<u8> = Vec::new();
    h.write_state(&mut state_dump);

    let mut reader = SliceReader::new(&state_dump);
    twin.read_state(&mut reader).unwrap();
    assert_eq!(reader.remaining(), 0);

    for step in 100..130usize {
        let input = vec![inputs[step % 2]];
        h.step(&[&input], false, 0.0, 0.0).unwrap();
        twin.step(&[&input], false, 0.0, 0.0).unwrap();

        assert_eq!(
            h.get_prediction_cis(0).unwrap(),
            twin.get_prediction_cis(0).unwrap(),
            "state restore diverged at step {step}"
        );
    }
}

#[test]
fn test_truncated_stream_errors() {
    let (io_descs, layer_descs) = sequence_descs();
    let h = Hierarchy::new(&io_descs, &layer_descs, 1337).unwrap();

    let mut dump: Vec<u8> = Vec::new();
    h.write(&mut dump);

    let truncated = &dump[..dump.len() / 2];
    let mut reader = SliceReader::new(truncated);

    assert!(matches!(
        Hierarchy::read(&mut reader),
        Err(Error::Serialization(_))
    ));
}
