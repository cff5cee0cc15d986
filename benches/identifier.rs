use criterion::{criterion_group, criterion_main, Criterion};
use usig_core::tee::{EnclaveImage, LoaderSession};
use usig_core::usig::{self, IdentifierService, UsigEnclave};

fn bench_identifier(c: &mut Criterion) {
    let service = IdentifierService::new(LoaderSession::simulated());
    let image = EnclaveImage::builtin();
    let handle = service.initialize(&image, None).unwrap();
    let digest = usig::message_digest(b"PREPARE view=1 seq=1");

    c.bench_function("create_identifier", |b| {
        b.iter(|| service.create_identifier(handle, &digest).unwrap())
    });

    let epoch = service.get_epoch(handle).unwrap();
    let public = service.get_public_key(handle).unwrap();
    let (counter, signature) = service.create_identifier(handle, &digest).unwrap();
    c.bench_function("verify_identifier", |b| {
        b.iter(|| usig::verify(&public, &digest, epoch, counter, &signature))
    });

    let sealed = service.export_sealed_key(handle).unwrap();
    c.bench_function("initialize_from_sealed_key", |b| {
        b.iter(|| {
            let h = service.initialize(&image, Some(&sealed)).unwrap();
            service.destroy(h).unwrap();
        })
    });

    c.bench_function("export_sealed_key", |b| {
        b.iter(|| service.export_sealed_key(handle).unwrap())
    });

    let session = LoaderSession::simulated();
    let instance = usig::UsigInstance::initialize(&session, &image, None).unwrap();
    c.bench_function("create_identifier_direct", |b| {
        b.iter(|| instance.create_identifier(&digest).unwrap())
    });
}

criterion_group!(benches, bench_identifier);
criterion_main!(benches);
