mod common;

use driver::DriverType;
use serde_json::json;

const USER_MAPPER: &str = r#"<mapper namespace="U">
  <select id="findById" resultType="map">SELECT id, name FROM users WHERE id = #{id}</select>
  <update id="updateById">UPDATE users SET name = #{name} WHERE id = #{id}</update>
</mapper>"#;

const CACHED_USER_MAPPER: &str = r#"<mapper namespace="U">
  <cache/>
  <select id="findById" resultType="map">SELECT id, name FROM users WHERE id = #{id}</select>
  <update id="updateById">UPDATE users SET name = #{name} WHERE id = #{id}</update>
</mapper>"#;

const FIND_SQL: &str = "SELECT id, name FROM users WHERE id = ?";
const UPDATE_SQL: &str = "UPDATE users SET name = ? WHERE id = ?";

fn script_user(script: &driver::testing::Script) {
    script.when(FIND_SQL).returns(
        &[("id", DriverType::Integer), ("name", DriverType::Varchar)],
        vec![vec![json!(7), json!("Ann")]],
    );
    script.when(UPDATE_SQL).update_count(1);
}

#[test]
fn local_cache_serves_repeat_queries_until_a_write() {
    let (script, factory) = common::factory("mem://it-localcache", USER_MAPPER);
    script_user(&script);

    let mut session = factory.open_session().unwrap();
    let first = session.select_one("U.findById", json!({"id": 7})).unwrap();
    let second = session.select_one("U.findById", json!({"id": 7})).unwrap();
    assert_eq!(first, second);
    // one driver execution for the two reads
    assert_eq!(script.execution_count(FIND_SQL), 1);

    session
        .update("U.updateById", &mut json!({"id": 7, "name": "Anna"}))
        .unwrap();
    session.select_one("U.findById", json!({"id": 7})).unwrap();
    assert_eq!(script.execution_count(FIND_SQL), 2);
}

#[test]
fn distinct_parameters_are_distinct_cache_entries() {
    let (script, factory) = common::factory("mem://it-localkeys", USER_MAPPER);
    script_user(&script);

    let mut session = factory.open_session().unwrap();
    session.select_one("U.findById", json!({"id": 7})).unwrap();
    session.select_one("U.findById", json!({"id": 8})).unwrap();
    assert_eq!(script.execution_count(FIND_SQL), 2);
}

#[test]
fn statement_scope_clears_after_every_query() {
    let settings = r#"<settings><setting name="localCacheScope" value="STATEMENT"/></settings>"#;
    let (script, factory) =
        common::factory_with("mem://it-stmtscope", USER_MAPPER, settings);
    script_user(&script);

    let mut session = factory.open_session().unwrap();
    session.select_one("U.findById", json!({"id": 7})).unwrap();
    session.select_one("U.findById", json!({"id": 7})).unwrap();
    assert_eq!(script.execution_count(FIND_SQL), 2);
}

#[test]
fn clear_cache_drops_the_session_cache() {
    let (script, factory) = common::factory("mem://it-clearcache", USER_MAPPER);
    script_user(&script);

    let mut session = factory.open_session().unwrap();
    session.select_one("U.findById", json!({"id": 7})).unwrap();
    session.clear_cache();
    session.select_one("U.findById", json!({"id": 7})).unwrap();
    assert_eq!(script.execution_count(FIND_SQL), 2);
}

#[test]
fn second_tier_cache_crosses_sessions_at_commit() {
    let (script, factory) = common::factory("mem://it-secondtier", CACHED_USER_MAPPER);
    script_user(&script);

    // session A misses, loads from the driver, and publishes at commit
    let mut a = factory.open_session().unwrap();
    a.select_one("U.findById", json!({"id": 7})).unwrap();
    assert_eq!(script.execution_count(FIND_SQL), 1);
    a.commit(false).unwrap();
    a.close();

    // session B is served from the shared cache without a driver call
    let mut b = factory.open_session().unwrap();
    let row = b.select_one("U.findById", json!({"id": 7})).unwrap().unwrap();
    assert_eq!(row, json!({"id": 7, "name": "Ann"}));
    assert_eq!(script.execution_count(FIND_SQL), 1);

    // session C writes through the namespace and commits
    let mut c = factory.open_session().unwrap();
    c.update("U.updateById", &mut json!({"id": 7, "name": "Anna"}))
        .unwrap();
    c.commit(false).unwrap();
    c.close();

    // the shared entry is gone: B hits the driver again
    b.select_one("U.findById", json!({"id": 7})).unwrap();
    assert_eq!(script.execution_count(FIND_SQL), 2);
}

#[test]
fn uncommitted_writes_stay_invisible_to_other_sessions() {
    let (script, factory) = common::factory("mem://it-staging", CACHED_USER_MAPPER);
    script_user(&script);

    let mut a = factory.open_session().unwrap();
    a.select_one("U.findById", json!({"id": 7})).unwrap();
    // not committed: the result is only staged

    let mut b = factory.open_session().unwrap();
    b.select_one("U.findById", json!({"id": 7})).unwrap();
    assert_eq!(script.execution_count(FIND_SQL), 2);
    a.close();
    b.close();
}

#[test]
fn rollback_discards_staged_entries() {
    let (script, factory) = common::factory("mem://it-cacherollback", CACHED_USER_MAPPER);
    script_user(&script);

    let mut a = factory.open_session().unwrap();
    a.select_one("U.findById", json!({"id": 7})).unwrap();
    a.rollback(false).unwrap();
    a.close();

    let mut b = factory.open_session().unwrap();
    b.select_one("U.findById", json!({"id": 7})).unwrap();
    assert_eq!(script.execution_count(FIND_SQL), 2);
    b.close();
}
