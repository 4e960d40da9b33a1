use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use fieldstat::data::{FieldData, LoadOptions, load_csv_str};
use fieldstat::formula::Formula;
use fieldstat::model::{FitOptions, fit_model};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

const BLOCKS: usize = 4;

// A complete block trial with `genotypes` entries in each of four blocks.
fn simulated_trial(genotypes: usize) -> FieldData {
    let mut rng = StdRng::seed_from_u64(0x5EED + genotypes as u64);
    let block_effect = Normal::new(0.0, 0.8).expect("valid sd");
    let plot_error = Normal::new(0.0, 0.4).expect("valid sd");
    let means: Vec<f64> = (0..genotypes).map(|_| rng.gen_range(3.0..6.0)).collect();

    let mut csv = String::from("yield,genotype,block\n");
    for block in 1..=BLOCKS {
        let shift = block_effect.sample(&mut rng);
        for (g, mean) in means.iter().enumerate() {
            let value = mean + shift + plot_error.sample(&mut rng);
            csv.push_str(&format!("{value:.3},G{g},{block}\n"));
        }
    }
    let options = LoadOptions {
        factors: vec!["block".to_string()],
        ..LoadOptions::default()
    };
    load_csv_str(&csv, &options).expect("simulated trial parses")
}

fn benchmark_fits(c: &mut Criterion) {
    let fixed = Formula::parse("yield ~ genotype + block").expect("formula");
    let mixed = Formula::parse("yield ~ genotype + (1 | block)").expect("formula");
    let options = FitOptions::default();
    let trials: Vec<_> = [10_usize, 50, 200]
        .iter()
        .map(|&n| (n, simulated_trial(n)))
        .collect();

    let mut group = c.benchmark_group("rcbd_fit");
    for (genotypes, data) in trials.iter() {
        group.throughput(Throughput::Elements((genotypes * BLOCKS) as u64));

        group.bench_with_input(BenchmarkId::new("lm", genotypes), data, |b, input| {
            b.iter(|| {
                let fit = fit_model(black_box(&fixed), black_box(input), &options);
                black_box(fit.is_ok());
            });
        });

        group.bench_with_input(BenchmarkId::new("lmm", genotypes), data, |b, input| {
            b.iter(|| {
                let fit = fit_model(black_box(&mixed), black_box(input), &options);
                black_box(fit.is_ok());
            });
        });
    }
    group.finish();
}

criterion_group!(mixed_fit, benchmark_fits);
criterion_main!(mixed_fit);
