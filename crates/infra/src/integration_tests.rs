//! Integration tests for the membership pipeline.
//!
//! Tests: GroupController → ledgers → materialized view
//!
//! Verifies:
//! - Direct and template grants merge to the latest expiry
//! - Revoking one grant never removes a membership another grant justifies
//! - Failed operations leave no partial writes
//! - Paged reads agree with counts

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use warden_core::{
        GroupMember, MembershipError, Pagination, Subject, SubjectPk, SubjectType, TemplateId,
        PERMANENT_EXPIRED_AT,
    };

    use crate::config::PagingConfig;
    use crate::group_controller::GroupController;
    use crate::store::{InMemoryMembershipStore, MembershipView};

    struct Fixture {
        store: Arc<InMemoryMembershipStore>,
        controller: GroupController<InMemoryMembershipStore>,
        group: Subject,
    }

    async fn setup() -> Fixture {
        let store = Arc::new(InMemoryMembershipStore::new());
        store
            .register_subject_with_pk(Subject::group("g100"), SubjectPk::new(100))
            .await
            .unwrap();
        store
            .register_subject_with_pk(Subject::user("u5"), SubjectPk::new(5))
            .await
            .unwrap();
        let controller = GroupController::new(Arc::clone(&store));
        Fixture {
            store,
            controller,
            group: Subject::group("g100"),
        }
    }

    fn tpl(id: i64) -> TemplateId {
        TemplateId::new(id)
    }

    #[tokio::test]
    async fn direct_and_template_grants_merge_then_unwind() {
        let Fixture {
            controller, group, ..
        } = setup().await;
        let u5 = Subject::user("u5");

        let created = controller
            .create_or_update_subject_members(&group, &[GroupMember::new(u5.clone(), 1000)])
            .await
            .unwrap();
        assert_eq!(created.get(SubjectType::User), 1);
        controller
            .apply_template_grant(tpl(7), &group, &[GroupMember::new(u5.clone(), 2000)])
            .await
            .unwrap();

        let groups = controller.list_subject_groups(&u5, None).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group, group);
        assert_eq!(groups[0].expired_at, 2000);

        let summary = controller
            .revoke_template_grant(tpl(7), &group, &[u5.clone()])
            .await
            .unwrap();
        assert_eq!(summary.revoked.get(SubjectType::User), 1);
        assert_eq!(summary.removed.total(), 0);
        let groups = controller.list_subject_groups(&u5, None).await.unwrap();
        assert_eq!(groups[0].expired_at, 1000);

        let deleted = controller
            .delete_subject_members(&group, &[u5.clone()])
            .await
            .unwrap();
        assert_eq!(deleted.get(SubjectType::User), 1);
        assert!(controller.list_subject_groups(&u5, None).await.unwrap().is_empty());
        assert!(matches!(
            controller.get_membership_expired_at(&u5, &group).await,
            Err(MembershipError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn adding_twice_changes_nothing_and_never_shortens() {
        let Fixture {
            store,
            controller,
            group,
        } = setup().await;
        store.register_subject(Subject::department("d1")).await;
        let members = vec![
            GroupMember::new(Subject::user("u5"), 500),
            GroupMember::new(Subject::department("d1"), 700),
        ];

        let first = controller
            .create_or_update_subject_members(&group, &members)
            .await
            .unwrap();
        assert_eq!(first.get(SubjectType::User), 1);
        assert_eq!(first.get(SubjectType::Department), 1);

        let writes = store.write_count();
        let second = controller
            .create_or_update_subject_members(&group, &members)
            .await
            .unwrap();
        assert_eq!(second.total(), 0);
        assert_eq!(store.write_count(), writes);

        // A shorter request leaves the longer grant in place.
        controller
            .create_or_update_subject_members(&group, &[GroupMember::new(Subject::user("u5"), 100)])
            .await
            .unwrap();
        assert_eq!(
            controller
                .get_membership_expired_at(&Subject::user("u5"), &group)
                .await
                .unwrap(),
            500
        );
    }

    #[tokio::test]
    async fn explicit_expiry_update_may_shorten_a_direct_grant() {
        let Fixture {
            controller, group, ..
        } = setup().await;
        let u5 = Subject::user("u5");
        controller
            .create_or_update_subject_members(&group, &[GroupMember::new(u5.clone(), 900)])
            .await
            .unwrap();

        controller
            .update_subject_members_expired_at(
                &group,
                &[
                    GroupMember::new(u5.clone(), 300),
                    GroupMember::new(u5.clone(), 200),
                    GroupMember::new(Subject::user("nobody"), 50),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            controller.get_membership_expired_at(&u5, &group).await.unwrap(),
            200
        );
    }

    #[tokio::test]
    async fn revoking_one_template_keeps_a_membership_granted_by_another() {
        let Fixture {
            store,
            controller,
            group,
        } = setup().await;
        store.register_subject(Subject::user("u6")).await;
        let u5 = Subject::user("u5");
        let u6 = Subject::user("u6");

        controller
            .apply_template_grant(
                tpl(7),
                &group,
                &[GroupMember::new(u5.clone(), 300), GroupMember::new(u6.clone(), 300)],
            )
            .await
            .unwrap();
        controller
            .apply_template_grant(tpl(8), &group, &[GroupMember::new(u5.clone(), 100)])
            .await
            .unwrap();

        let summary = controller
            .revoke_template_grant(tpl(7), &group, &[u5.clone(), u6.clone()])
            .await
            .unwrap();
        assert_eq!(summary.revoked.get(SubjectType::User), 2);
        assert_eq!(summary.removed.get(SubjectType::User), 1);

        assert_eq!(
            controller.get_membership_expired_at(&u5, &group).await.unwrap(),
            100
        );
        assert!(controller.list_subject_groups(&u6, None).await.unwrap().is_empty());

        // Revoking again finds nothing left to revoke.
        let again = controller
            .revoke_template_grant(tpl(7), &group, &[u5.clone()])
            .await
            .unwrap();
        assert_eq!(again.revoked.total(), 0);
    }

    #[tokio::test]
    async fn template_renewal_is_scoped_to_its_template() {
        let Fixture {
            controller, group, ..
        } = setup().await;
        let u5 = Subject::user("u5");
        controller
            .apply_template_grant(tpl(7), &group, &[GroupMember::new(u5.clone(), 100)])
            .await
            .unwrap();
        controller
            .apply_template_grant(tpl(8), &group, &[GroupMember::new(u5.clone(), 300)])
            .await
            .unwrap();

        controller
            .update_template_grant_expired_at(tpl(7), &group, &[GroupMember::new(u5.clone(), 150)])
            .await
            .unwrap();

        let of_7 = controller.list_template_members(tpl(7), Some(&group)).await.unwrap();
        let of_8 = controller.list_template_members(tpl(8), None).await.unwrap();
        assert_eq!(of_7.len(), 1);
        assert_eq!(of_7[0].subject, u5);
        assert_eq!(of_7[0].group, group);
        assert_eq!(of_7[0].expired_at, 150);
        assert_eq!(of_8[0].expired_at, 300);
        assert_eq!(
            controller.get_membership_expired_at(&u5, &group).await.unwrap(),
            300
        );
    }

    #[tokio::test]
    async fn applying_a_template_again_only_extends() {
        let Fixture {
            controller, group, ..
        } = setup().await;
        let u5 = Subject::user("u5");
        let first = controller
            .apply_template_grant(tpl(7), &group, &[GroupMember::new(u5.clone(), 400)])
            .await
            .unwrap();
        assert_eq!(first.get(SubjectType::User), 1);

        let second = controller
            .apply_template_grant(tpl(7), &group, &[GroupMember::new(u5.clone(), 200)])
            .await
            .unwrap();
        assert_eq!(second.total(), 0);
        controller
            .apply_template_grant(tpl(7), &group, &[GroupMember::new(u5.clone(), 600)])
            .await
            .unwrap();

        let rows = controller.list_template_members(tpl(7), None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].expired_at, 600);
    }

    #[tokio::test]
    async fn a_failed_write_rolls_back_the_whole_batch() {
        let Fixture {
            store,
            controller,
            group,
        } = setup().await;
        store.register_subject(Subject::user("u6")).await;
        store.register_subject(Subject::user("u7")).await;
        let members = vec![
            GroupMember::new(Subject::user("u5"), 100),
            GroupMember::new(Subject::user("u6"), 100),
            GroupMember::new(Subject::user("u7"), 100),
        ];

        store.inject_write_failure(2);
        let err = controller
            .create_or_update_subject_members(&group, &members)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.direct_row_count().await, 0);
        assert_eq!(controller.count_members(&group).await.unwrap(), 0);

        // The same request succeeds once the fault is gone.
        controller
            .create_or_update_subject_members(&group, &members)
            .await
            .unwrap();
        assert_eq!(controller.count_members(&group).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn a_failed_template_grant_leaves_no_contributions() {
        let Fixture {
            store,
            controller,
            group,
        } = setup().await;
        store.register_subject(Subject::user("u6")).await;
        store.register_subject(Subject::department("d1")).await;
        let members = vec![
            GroupMember::new(Subject::user("u5"), 100),
            GroupMember::new(Subject::user("u6"), 100),
            GroupMember::new(Subject::department("d1"), 100),
        ];

        store.inject_write_failure(2);
        let err = controller
            .apply_template_grant(tpl(7), &group, &members)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.contribution_row_count().await, 0);
        assert!(controller.list_template_members(tpl(7), None).await.unwrap().is_empty());
        assert_eq!(controller.count_members(&group).await.unwrap(), 0);

        let created = controller
            .apply_template_grant(tpl(7), &group, &members)
            .await
            .unwrap();
        assert_eq!(created.get(SubjectType::User), 2);
        assert_eq!(created.get(SubjectType::Department), 1);
        assert_eq!(store.contribution_row_count().await, 3);
    }

    #[tokio::test]
    async fn deleting_the_direct_row_keeps_a_template_membership() {
        let Fixture {
            store,
            controller,
            group,
        } = setup().await;
        let u5 = Subject::user("u5");

        controller
            .create_or_update_subject_members(&group, &[GroupMember::new(u5.clone(), 3000)])
            .await
            .unwrap();
        controller
            .apply_template_grant(tpl(7), &group, &[GroupMember::new(u5.clone(), 2000)])
            .await
            .unwrap();
        assert_eq!(
            controller.get_membership_expired_at(&u5, &group).await.unwrap(),
            3000
        );

        let deleted = controller
            .delete_subject_members(&group, &[u5.clone()])
            .await
            .unwrap();
        assert_eq!(deleted.get(SubjectType::User), 1);
        assert_eq!(store.direct_row_count().await, 0);
        assert_eq!(store.contribution_row_count().await, 1);
        assert_eq!(
            controller.get_membership_expired_at(&u5, &group).await.unwrap(),
            2000
        );

        // Nothing left to delete directly; the unknown subject is skipped.
        let again = controller
            .delete_subject_members(&group, &[u5.clone(), Subject::user("ghost")])
            .await
            .unwrap();
        assert_eq!(again.total(), 0);
        assert_eq!(again.get(SubjectType::Department), 0);
        assert_eq!(store.contribution_row_count().await, 1);
        assert_eq!(controller.count_members(&group).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_member_fails_the_add_before_any_transaction() {
        let Fixture {
            store,
            controller,
            group,
        } = setup().await;
        let err = controller
            .create_or_update_subject_members(
                &group,
                &[
                    GroupMember::new(Subject::user("u5"), 100),
                    GroupMember::new(Subject::user("ghost"), 100),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::NotFound(_)));
        assert_eq!(store.transaction_count(), 0);

        let missing_group = controller
            .create_or_update_subject_members(
                &Subject::group("nope"),
                &[GroupMember::new(Subject::user("u5"), 100)],
            )
            .await
            .unwrap_err();
        assert!(matches!(missing_group, MembershipError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_the_store() {
        let Fixture {
            store,
            controller,
            group,
        } = setup().await;

        let negative = controller
            .create_or_update_subject_members(&group, &[GroupMember::new(Subject::user("u5"), -1)])
            .await;
        let group_as_member = controller
            .apply_template_grant(tpl(7), &group, &[GroupMember::new(Subject::group("g1"), 1)])
            .await;
        let bad_template = controller
            .revoke_template_grant(tpl(0), &group, &[Subject::user("u5")])
            .await;
        let not_a_group = controller
            .list_members(&Subject::user("u5"), Pagination::default())
            .await;
        let oversized_page = controller
            .list_members(&group, Pagination { limit: 5000, offset: 0 })
            .await;

        for result in [
            negative.map(|_| ()),
            group_as_member.map(|_| ()),
            bad_template.map(|_| ()),
            not_a_group.map(|_| ()),
            oversized_page.map(|_| ()),
        ] {
            assert!(matches!(result, Err(MembershipError::Validation(_))));
        }
        assert_eq!(store.transaction_count(), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn empty_batches_touch_nothing() {
        let Fixture {
            store,
            controller,
            group,
        } = setup().await;

        let added = controller
            .create_or_update_subject_members(&group, &[])
            .await
            .unwrap();
        let deleted = controller.delete_subject_members(&group, &[]).await.unwrap();
        controller
            .update_subject_members_expired_at(&group, &[])
            .await
            .unwrap();
        let granted = controller.apply_template_grant(tpl(7), &group, &[]).await.unwrap();
        let revoked = controller
            .revoke_template_grant(tpl(7), &group, &[])
            .await
            .unwrap();

        assert_eq!(added.total() + deleted.total() + granted.total(), 0);
        assert_eq!(revoked.revoked.total(), 0);
        assert_eq!(added.get(SubjectType::Department), 0);
        assert_eq!(store.transaction_count(), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn paging_covers_every_member_exactly_once() {
        for size in [0usize, 1, 7, 20] {
            let Fixture {
                store,
                controller,
                group,
            } = setup().await;
            let mut direct = Vec::new();
            let mut templated = Vec::new();
            for i in 0..size {
                let subject = Subject::user(format!("p{i}"));
                store.register_subject(subject.clone()).await;
                match i % 3 {
                    0 => direct.push(GroupMember::new(subject, 100 + i as i64)),
                    1 => templated.push(GroupMember::new(subject, 100 + i as i64)),
                    _ => {
                        direct.push(GroupMember::new(subject.clone(), 10));
                        templated.push(GroupMember::new(subject, 20));
                    }
                }
            }
            controller
                .create_or_update_subject_members(&group, &direct)
                .await
                .unwrap();
            controller
                .apply_template_grant(tpl(7), &group, &templated)
                .await
                .unwrap();

            let total = controller.count_members(&group).await.unwrap();
            assert_eq!(total, size as u64);

            for limit in [1u32, 3, 50] {
                let mut seen = Vec::new();
                let mut offset = 0;
                loop {
                    let page = controller
                        .list_members(&group, Pagination::page(limit, offset).unwrap())
                        .await
                        .unwrap();
                    if page.is_empty() {
                        break;
                    }
                    offset += page.len() as u32;
                    seen.extend(page);
                }
                assert_eq!(seen.len() as u64, total, "size {size}, limit {limit}");
                let mut ids: Vec<&str> = seen.iter().map(|m| m.subject.id.as_str()).collect();
                ids.dedup();
                assert_eq!(ids.len(), seen.len());
            }
        }
    }

    #[tokio::test]
    async fn expiry_queries_use_the_merged_expiry() {
        let Fixture {
            store,
            controller,
            group,
        } = setup().await;
        let g101 = Subject::group("g101");
        store.register_subject(g101.clone()).await;
        store.register_subject(Subject::user("u6")).await;
        let u5 = Subject::user("u5");
        let u6 = Subject::user("u6");

        // u5 expires at 100 directly but is kept alive to 900 by a template.
        controller
            .create_or_update_subject_members(
                &group,
                &[GroupMember::new(u5.clone(), 100), GroupMember::new(u6.clone(), 200)],
            )
            .await
            .unwrap();
        controller
            .apply_template_grant(tpl(7), &group, &[GroupMember::new(u5.clone(), 900)])
            .await
            .unwrap();
        controller
            .create_or_update_subject_members(
                &g101,
                &[GroupMember::new(u5.clone(), PERMANENT_EXPIRED_AT)],
            )
            .await
            .unwrap();

        let expiring = controller
            .list_members_before_expiration(&group, 500, controller.first_page())
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].subject, u6);
        assert_eq!(
            controller
                .count_members_before_expiration(&group, 500)
                .await
                .unwrap(),
            1
        );

        let groups = controller
            .filter_subjects_with_expiring_membership(
                &[g101.clone(), group.clone(), Subject::group("unknown")],
                500,
            )
            .await
            .unwrap();
        assert_eq!(groups, vec![group.clone()]);

        let u5_groups = controller.list_subject_groups(&u5, None).await.unwrap();
        assert_eq!(
            u5_groups.iter().map(|g| g.group.clone()).collect::<Vec<_>>(),
            vec![group.clone(), g101.clone()]
        );
        let u5_expiring = controller
            .list_subject_groups(&u5, Some(1000))
            .await
            .unwrap();
        assert_eq!(u5_expiring.len(), 1);
        assert_eq!(u5_expiring[0].expired_at, 900);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_grants_and_revocations_serialize_per_group() {
        let Fixture {
            store,
            controller,
            group,
        } = setup().await;
        let u5 = Subject::user("u5");
        controller
            .apply_template_grant(tpl(8), &group, &[GroupMember::new(u5.clone(), 100)])
            .await
            .unwrap();

        let mut handles = Vec::new();
        for round in 0..8i64 {
            let c = controller.clone();
            let g = group.clone();
            let s = u5.clone();
            handles.push(tokio::spawn(async move {
                if round % 2 == 0 {
                    c.apply_template_grant(tpl(7), &g, &[GroupMember::new(s, 500 + round)])
                        .await
                        .map(|_| ())
                } else {
                    c.revoke_template_grant(tpl(8), &g, &[s]).await.map(|_| ())
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Template 7 was applied at least once and never revoked.
        let membership = store
            .get_membership(SubjectPk::new(5), SubjectPk::new(100).into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(membership.expired_at, 506);
        assert!(
            controller
                .list_template_members(tpl(8), None)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn paging_limits_follow_configuration() {
        let store = Arc::new(InMemoryMembershipStore::new());
        store.register_subject(Subject::group("g")).await;
        let controller = GroupController::with_paging(
            Arc::clone(&store),
            PagingConfig {
                default_limit: 5,
                max_limit: 10,
            },
        );

        assert_eq!(controller.first_page().limit, 5);
        assert!(
            controller
                .list_members(&Subject::group("g"), Pagination::page(11, 0).unwrap())
                .await
                .is_err()
        );
        assert!(
            controller
                .list_members(&Subject::group("g"), Pagination::page(10, 0).unwrap())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
