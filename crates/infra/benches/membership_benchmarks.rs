use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use tokio::runtime::Runtime;

use warden_core::{GroupMember, Pagination, Subject, TemplateId};
use warden_infra::group_controller::GroupController;
use warden_infra::store::InMemoryMembershipStore;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("failed to build runtime")
}

/// A group with `size` registered users, none of them members yet.
fn seeded(
    rt: &Runtime,
    size: usize,
) -> (
    GroupController<InMemoryMembershipStore>,
    Subject,
    Vec<GroupMember>,
) {
    let store = Arc::new(InMemoryMembershipStore::new());
    let group = Subject::group("bench");
    let members = rt.block_on(async {
        store.register_subject(group.clone()).await;
        let mut members = Vec::with_capacity(size);
        for i in 0..size {
            let subject = Subject::user(format!("u{i}"));
            store.register_subject(subject.clone()).await;
            members.push(GroupMember::new(subject, 1_000 + i as i64));
        }
        members
    });
    (GroupController::new(store), group, members)
}

fn bench_add_members_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_members_throughput");
    let rt = runtime();

    for batch_size in [1usize, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("create_or_update", batch_size),
            batch_size,
            |b, &size| {
                b.iter_with_setup(
                    || seeded(&rt, size),
                    |(controller, g, members)| {
                        rt.block_on(async {
                            black_box(
                                controller
                                    .create_or_update_subject_members(&g, &members)
                                    .await
                                    .expect("add failed"),
                            );
                        })
                    },
                );
            },
        );
    }

    group.finish();
}

fn bench_template_grant_and_revoke(c: &mut Criterion) {
    let mut group = c.benchmark_group("template_grant_and_revoke");
    let rt = runtime();

    for batch_size in [10usize, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("apply_then_revoke", batch_size),
            batch_size,
            |b, &size| {
                let (controller, g, members) = seeded(&rt, size);
                let subjects: Vec<Subject> = members.iter().map(|m| m.subject.clone()).collect();
                b.iter(|| {
                    rt.block_on(async {
                        controller
                            .apply_template_grant(TemplateId::new(7), &g, &members)
                            .await
                            .expect("grant failed");
                        black_box(
                            controller
                                .revoke_template_grant(TemplateId::new(7), &g, &subjects)
                                .await
                                .expect("revoke failed"),
                        );
                    })
                });
            },
        );
    }

    group.finish();
}

fn bench_merged_listing(c: &mut Criterion) {
    let mut group = c.benchmark_group("merged_listing");
    let rt = runtime();

    for member_count in [100usize, 1000, 10000].iter() {
        let (controller, g, members) = seeded(&rt, *member_count);
        rt.block_on(async {
            let (direct, templated) = members.split_at(member_count / 2);
            controller
                .create_or_update_subject_members(&g, direct)
                .await
                .expect("add failed");
            controller
                .apply_template_grant(TemplateId::new(7), &g, templated)
                .await
                .expect("grant failed");
        });

        group.bench_with_input(
            BenchmarkId::new("first_page", member_count),
            member_count,
            |b, _| {
                b.iter(|| {
                    rt.block_on(async {
                        black_box(
                            controller
                                .list_members(&g, Pagination::default())
                                .await
                                .expect("list failed"),
                        );
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_add_members_throughput,
    bench_template_grant_and_revoke,
    bench_merged_listing
);
criterion_main!(benches);
