//! Codec benchmarks: serialize/parse of a realistic response record.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wproc_core::KvVec;

fn response_record() -> KvVec {
    let mut kvv = KvVec::new();
    kvv.add_str("job_id", "4711");
    kvv.add_str("type", "0");
    kvv.add_str("command", "/usr/lib/monitoring/check_disk -w 20% -c 10% /");
    kvv.add_str("timeout", "60");
    kvv.add_str("wait_status", "0");
    kvv.add_str("stdout", "DISK OK - free space: / 3326 MB (56%);\n");
    kvv.add_str("stderr", "");
    kvv.add_str("start", "1700000000.123456");
    kvv.add_str("stop", "1700000000.234567");
    kvv.add_str("runtime", "0.111111");
    kvv.add_str("ru_utime", "0.004000");
    kvv.add_str("ru_stime", "0.002000");
    kvv.add_str("ru_minflt", "212");
    kvv.add_str("ru_majflt", "0");
    kvv.add_str("ru_nswap", "0");
    kvv.add_str("ru_inblock", "16");
    kvv.add_str("ru_oublock", "0");
    kvv.add_str("ru_nsignals", "0");
    kvv
}

fn bench_serialize(c: &mut Criterion) {
    let kvv = response_record();
    c.bench_function("kvvec_serialize", |b| {
        b.iter(|| black_box(kvv.to_frame()))
    });
}

fn bench_parse(c: &mut Criterion) {
    let buf = response_record().to_frame();
    c.bench_function("kvvec_parse", |b| {
        b.iter(|| black_box(KvVec::parse_frame(&buf.data)))
    });
}

criterion_group!(benches, bench_serialize, bench_parse);
criterion_main!(benches);
