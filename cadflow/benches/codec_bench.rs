//! Benchmarks for the expression codec.

use cadflow::codec::{decode_line, render_expression_file, ParamType, Parameter, ParameterSet};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn design_table(rows: usize) -> ParameterSet {
    let mut params = ParameterSet::new();
    for i in 0..rows {
        let param = match i % 4 {
            0 => Parameter::number(format!("L{i}"), i as f64 * 0.5).map(|p| p.with_unit("mm")),
            1 => Parameter::new(format!("n{i}"), ParamType::Integer, json!(i)),
            2 => Parameter::new(format!("p{i}"), ParamType::Point, json!([i, 0, -1.5])),
            _ => Parameter::new(format!("s{i}"), ParamType::String, json!("bracket \"A\"")),
        };
        params.insert(param.unwrap()).unwrap();
    }
    params
}

fn codec_benchmark(c: &mut Criterion) {
    let table = design_table(200);
    c.bench_function("render_200_expressions", |b| {
        b.iter(|| render_expression_file(black_box(&table)).unwrap())
    });

    c.bench_function("decode_line", |b| {
        b.iter(|| decode_line(black_box("[mm]L4=2.0")).unwrap())
    });
}

criterion_group!(benches, codec_benchmark);
criterion_main!(benches);
