use snapsync_core::{high_water_mark, NormalizePolicy};
use snapsync_source::{decode_votes_response, normalize_batch};

fn fixture_bytes() -> Vec<u8> {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/votes_response.json");
    std::fs::read(path).expect("fixture exists")
}

#[test]
fn hub_response_fixture_normalizes() {
    let raw = decode_votes_response(&fixture_bytes()).expect("decode");
    assert_eq!(raw.len(), 2);

    let votes = normalize_batch(&raw, &NormalizePolicy::default()).expect("normalize");
    let first = &votes[0];
    assert_eq!(first.voter, "0xb8a4c2e4a2a1e5d1f6d9c0f1e0a7c3d2b1a0f9e8");
    assert_eq!(first.space_id, "aave.eth");
    assert_eq!(first.space_name, "aave");
    assert_eq!(first.space_admins, vec!["0xec568fffba86c094cf06b22134b23074dfe2252c"]);
    assert!(first.space_moderators.is_empty());
    assert_eq!(first.proposal_id, "0xabcdef0123456789");
    assert_eq!(first.proposal_title, "[ARFC] Add wstETH to Aave V3");

    let ranked = &votes[1];
    assert_eq!(ranked.id, "QmRankedVote");
    assert_eq!(ranked.choice, 0);
    assert_eq!(ranked.space_name, "");
    assert!(ranked.space_members.is_empty());
    assert_eq!(ranked.proposal_author, "");

    assert_eq!(high_water_mark(&votes), Some(1_690_000_042));
}
