// Sequence prediction on a structured waveform.
//
// The hierarchy first trains on the signal, then runs closed-loop on its own
// predictions during a recall phase.
//
// Run with: cargo run --release --example wave_prediction

use sph::helpers::Int3;
use sph::hierarchy::{Hierarchy, IoDesc, IoType, LayerDesc};

/// Encode a float in [0, 1] as two 4-bit nibbles (2 columns, 16 cells each).
fn unorm8_to_csdr(x: f32) -> [i32; 2] {
    let i = (x * 255.0 + 0.5) as u8 as i32;
    [i & 0x0f, (i >> 4) & 0x0f]
}

/// Decode two 4-bit nibble indices back to a float in [0, 1].
fn csdr_to_unorm8(csdr: &[i32]) -> f32 {
    (csdr[0] | (csdr[1] << 4)) as f32 / 255.0
}

/// The target waveform: 1.0 whenever t is divisible by 20 or 7, else 0.0.
fn wave(t: usize) -> f32 {
    if t % 20 == 0 || t % 7 == 0 {
        1.0
    } else {
        0.0
    }
}

/// Render a float in [0,1] as a 16-character bar.
fn bar(x: f32) -> String {
    let filled = ((x * 16.0 + 0.5) as usize).min(16);
    (0..16)
        .map(|i| if i < filled { '\u{2588}' } else { '\u{2591}' })
        .collect()
}

fn main() {
    env_logger::init();

    let io_descs = vec![IoDesc {
        size: Int3::new(1, 2, 16),
        io_type: IoType::Prediction,
        ..Default::default()
    }];

    // three layers; each above the first updates half as often
    let layer_descs = vec![
        LayerDesc {
            hidden_size: Int3::new(5, 5, 32),
            ..Default::default()
        };
        3
    ];

    let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337).expect("valid configuration");

    let train_steps = 3000usize;
    let recall_steps = 60usize;

    println!("training on {train_steps} steps of the waveform...");

    for t in 0..train_steps {
        let csdr = unorm8_to_csdr(wave(t));
        h.step(&[&csdr], true, 0.0, 0.0).expect("step");
    }

    println!("recall (closed loop on own predictions):");
    println!("{:>6}  {:16}  {:16}", "t", "target", "predicted");

    let mut correct = 0usize;

    for t in train_steps..train_steps + recall_steps {
        let prediction: Vec<i32> = h.get_prediction_cis(0).expect("wired channel").to_vec();
        let predicted = csdr_to_unorm8(&prediction);
        let target = wave(t);

        if (predicted - target).abs() < 0.5 {
            correct += 1;
        }

        println!("{t:>6}  {}  {}", bar(target), bar(predicted));

        // feed the prediction back in as the next observation
        h.step(&[&prediction], false, 0.0, 0.0).expect("step");
    }

    println!("{correct}/{recall_steps} recall steps within tolerance");
}
