use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use heartgpt_rs::config::{QuantType, QuantizationConfig};
use heartgpt_rs::quantization::QuantizedWeight;
use heartgpt_rs::PipelineConfig;

const RECIPE_YAML: &str = r#"
model_name: NousResearch/Llama-2-7b-chat-hf
dataset_name: adarsha30735/datafood
new_model: llama-2-7b-heartgpt

quantization:
  load_in_4bit: true
  quant_type: nf4
  compute_dtype: float16
  double_quant: false

adapter:
  rank: 64
  alpha: 16
  dropout: 0.1
  target_modules:
    - q_proj
    - v_proj

training:
  output_dir: ./results
  num_train_epochs: 1
  per_device_train_batch_size: 4
  gradient_accumulation_steps: 1
  max_grad_norm: 0.3
  learning_rate: 2.0e-4
  weight_decay: 0.001
  optim: paged_adamw_32bit
  lr_scheduler_type: cosine
  max_steps: -1
  warmup_ratio: 0.03
  group_by_length: true
  logging_steps: 25
"#;

fn weight(rows: usize, cols: usize) -> Tensor {
    Tensor::randn(0f32, 0.02, (rows, cols), &Device::Cpu).unwrap()
}

fn bench_quantize(c: &mut Criterion) {
    let mut group = c.benchmark_group("quantize");
    for (rows, cols) in [(256, 256), (1024, 1024)] {
        let w = weight(rows, cols);
        for quant_type in [QuantType::Nf4, QuantType::Fp4] {
            for double_quant in [false, true] {
                let config = QuantizationConfig {
                    quant_type,
                    double_quant,
                    ..QuantizationConfig::default()
                };
                let id = BenchmarkId::new(format!("{quant_type}_dq{double_quant}"), format!("{rows}x{cols}"));
                group.bench_with_input(id, &w, |b, w| {
                    b.iter(|| black_box(QuantizedWeight::quantize(w, &config).unwrap()));
                });
            }
        }
    }
    group.finish();
}

fn bench_dequantize(c: &mut Criterion) {
    let mut group = c.benchmark_group("dequantize");
    for (rows, cols) in [(256, 256), (1024, 1024)] {
        let q = QuantizedWeight::quantize(&weight(rows, cols), &QuantizationConfig::default()).unwrap();
        for dtype in [DType::F32, DType::F16] {
            let id = BenchmarkId::new(format!("{dtype:?}"), format!("{rows}x{cols}"));
            group.bench_with_input(id, &q, |b, q| {
                b.iter(|| black_box(q.dequantize(dtype).unwrap()));
            });
        }
    }
    group.finish();
}

fn bench_config(c: &mut Criterion) {
    c.bench_function("config_from_yaml", |b| {
        b.iter(|| {
            let config: PipelineConfig = serde_yaml::from_str(black_box(RECIPE_YAML)).unwrap();
            black_box(config);
        });
    });

    c.bench_function("config_validate", |b| {
        let config = PipelineConfig::default();
        b.iter(|| black_box(config.validate()).unwrap());
    });
}

criterion_group!(benches, bench_quantize, bench_dequantize, bench_config);
criterion_main!(benches);
