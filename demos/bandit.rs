// Contextual bandit driven by the actor channel.
//
// One channel carries a random bit, the action channel is rewarded for
// echoing it. The action channel's input is the action the hierarchy chose
// on the previous step, closing the loop.
//
// Run with: cargo run --release --example bandit

use sph::helpers::{Int3, Rng};
use sph::hierarchy::{Hierarchy, IoDesc, IoType, LayerDesc};

fn main() {
    env_logger::init();

    let io_descs = vec![
        IoDesc {
            size: Int3::new(1, 1, 2),
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

    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).expect("valid configuration");

    let mut env_rng = Rng::new(42);

    let mut prev_bit = 0i32;
    let mut prev_action = 0i32;
    let mut window_reward = 0.0f32;

    let steps = 10_000usize;
    let report_every = 500usize;

    for step in 0..steps {
        let reward = if step > 0 && prev_action == prev_bit {
            1.0
        } else {
            0.0
        };

        let bit = env_rng.next_below(2) as i32;

        let observation = vec![bit];
        let action_echo = vec![prev_action];

        h.step(&[&observation, &action_echo], true, reward, 0.0)
            .expect("step");

        window_reward += reward;
        prev_bit = bit;
        prev_action = h.get_prediction_cis(1).expect("wired channel")[0];

        if (step + 1) % report_every == 0 {
            println!(
                "step {:>6}: mean reward {:.3}",
                step + 1,
                window_reward / report_every as f32
            );
            window_reward = 0.0;
        }
    }
}
