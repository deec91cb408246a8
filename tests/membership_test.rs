//! Gossip membership integration tests.

use std::sync::Arc;
use std::time::Duration;

use meshkv::cluster::{MemberList, MemberListConfig};
use meshkv::discovery::Localhost;

fn config(port: u16) -> MemberListConfig {
    MemberListConfig {
        bind_host: "127.0.0.1".to_string(),
        bind_port: port,
        ..MemberListConfig::default()
    }
}

fn ports(ports: &[u16]) -> Vec<String> {
    ports.iter().map(|port| port.to_string()).collect()
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn sorted_names(list: &MemberList) -> Vec<String> {
    let mut names = list.member_names();
    names.sort();
    names
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn members_converge() {
    let disco = Arc::new(Localhost::new(ports(&[7960, 7961, 7962])));

    let list1 = MemberList::new(config(7960), disco.clone()).await.unwrap();
    let list2 = MemberList::new(config(7961), disco.clone()).await.unwrap();
    let list3 = MemberList::new(config(7962), disco.clone()).await.unwrap();

    wait_until("all three views to converge", || {
        list1.member_count() == 3 && list2.member_count() == 3 && list3.member_count() == 3
    })
    .await;

    assert_eq!(sorted_names(&list1), sorted_names(&list2));
    assert_eq!(sorted_names(&list1), sorted_names(&list3));

    list1.shutdown(Duration::from_secs(1)).await;
    list2.shutdown(Duration::from_secs(1)).await;
    list3.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leave_propagates_to_survivors() {
    let disco = Arc::new(Localhost::new(ports(&[7970, 7971, 7972])));

    let list1 = MemberList::new(config(7970), disco.clone()).await.unwrap();
    let list2 = MemberList::new(config(7971), disco.clone()).await.unwrap();
    let list3 = MemberList::new(config(7972), disco.clone()).await.unwrap();

    wait_until("all three views to converge", || {
        list1.member_count() == 3 && list2.member_count() == 3 && list3.member_count() == 3
    })
    .await;

    let leaver = list1.name().to_string();
    list1.shutdown(Duration::from_secs(1)).await;

    wait_until("survivors to drop the leaver", || {
        list2.member_count() == 2 && list3.member_count() == 2
    })
    .await;

    assert!(!list2.member_names().contains(&leaver));
    assert!(!list3.member_names().contains(&leaver));

    list2.shutdown(Duration::from_secs(1)).await;
    list3.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_clusters_self_heal() {
    // Two pairs, each discovering only its own half of the network.
    let disco_a = Arc::new(Localhost::new(ports(&[7980, 7981])));
    let disco_b = Arc::new(Localhost::new(ports(&[7982, 7983])));

    let list1 = MemberList::new(config(7980), disco_a.clone()).await.unwrap();
    let list2 = MemberList::new(config(7981), disco_a.clone()).await.unwrap();
    let list3 = MemberList::new(config(7982), disco_b.clone()).await.unwrap();
    let list4 = MemberList::new(config(7983), disco_b.clone()).await.unwrap();

    wait_until("both pairs to form", || {
        list1.member_count() == 2
            && list2.member_count() == 2
            && list3.member_count() == 2
            && list4.member_count() == 2
    })
    .await;

    // One cross-seed is enough; gossip carries the rest of both views.
    disco_a.add_port("7982");

    wait_until("the full four-member view to emerge", || {
        list1.member_count() == 4
            && list2.member_count() == 4
            && list3.member_count() == 4
            && list4.member_count() == 4
    })
    .await;

    assert_eq!(sorted_names(&list1), sorted_names(&list2));
    assert_eq!(sorted_names(&list1), sorted_names(&list3));
    assert_eq!(sorted_names(&list1), sorted_names(&list4));

    for list in [&list1, &list2, &list3, &list4] {
        list.shutdown(Duration::from_secs(1)).await;
    }
}
