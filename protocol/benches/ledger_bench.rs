// Ledger and relayer hot-path benchmarks for CredMint.
//
// Covers credit reservation (lock, balance check, atomic commit), the
// reserve-then-queue issuance path, and signing a mint transaction.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use credmint_contracts::MintAbi;
use credmint_protocol::chain::UnsignedTx;
use credmint_protocol::credential::CredentialRepository;
use credmint_protocol::ledger::{AccountId, CreditLedger, Credits};
use credmint_protocol::signer::RelayerKey;
use credmint_protocol::storage::CredMintDB;
use credmint_protocol::IssuanceService;
use primitive_types::U256;

fn funded_ledger(credits: i64) -> (CreditLedger, AccountId) {
    let db = CredMintDB::open_temporary().expect("temp db");
    let ledger = CreditLedger::new(db);
    let account = AccountId::new();
    ledger.open_account(account).expect("open");
    ledger
        .purchase(&account, Credits::from_minor(credits), "bench-funding")
        .expect("fund");
    (ledger, account)
}

fn bench_reserve(c: &mut Criterion) {
    let (ledger, account) = funded_ledger(i64::MAX / 2);

    c.bench_function("ledger/reserve", |b| {
        b.iter(|| ledger.reserve(&account, Credits::from_minor(1)).expect("reserve"));
    });
}

fn bench_reserve_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger/reserve_contended");

    for threads in [2usize, 4, 8] {
        let (ledger, account) = funded_ledger(i64::MAX / 2);
        group.throughput(Throughput::Elements(threads as u64 * 16));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &n| {
            b.iter(|| {
                std::thread::scope(|scope| {
                    for _ in 0..n {
                        scope.spawn(|| {
                            for _ in 0..16 {
                                ledger
                                    .reserve(&account, Credits::from_minor(1))
                                    .expect("reserve");
                            }
                        });
                    }
                });
            });
        });
    }

    group.finish();
}

fn bench_issue(c: &mut Criterion) {
    let db = CredMintDB::open_temporary().expect("temp db");
    let service = IssuanceService::new(
        CreditLedger::new(db.clone()),
        CredentialRepository::new(db),
        Credits::from_minor(100),
    )
    .expect("service");
    let issuer = AccountId::new();
    service.open_account(issuer).expect("open");
    service
        .purchase(&issuer, Credits::from_minor(i64::MAX / 2), "bench-funding")
        .expect("fund");
    let recipient = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8"
        .parse()
        .expect("recipient");

    c.bench_function("issuance/issue", |b| {
        b.iter(|| {
            service
                .issue(&issuer, recipient, r#"{"name":"Ada","course":"Engines"}"#)
                .expect("issue")
        });
    });
}

fn bench_sign_mint(c: &mut Criterion) {
    let key = RelayerKey::generate("bench");
    let abi = MintAbi::default();
    let recipient = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8"
        .parse()
        .expect("recipient");
    let tx = UnsignedTx {
        nonce: 42,
        gas_price: 2_000_000_000,
        gas_limit: 300_000,
        to: "0x5fbdb2315678afecb367f032d93f642f64180aa3"
            .parse()
            .expect("registry"),
        value: U256::zero(),
        data: abi.encode_mint(&recipient, "ipfs://QmRN6wdp1S2A5EtjW9A3M1vKSBuQQGcgvuhoMUoEz4iiT5"),
        chain_id: 31_337,
    };

    c.bench_function("relayer/sign_mint_transaction", |b| {
        b.iter(|| key.sign_transaction(tx.clone()).expect("sign"));
    });
}

criterion_group!(
    benches,
    bench_reserve,
    bench_reserve_contended,
    bench_issue,
    bench_sign_mint
);
criterion_main!(benches);
