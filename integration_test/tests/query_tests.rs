mod common;

use driver::DriverType;
use relmap_core::{ResultContext, ResultHandler, RowBounds};
use serde_json::{json, Value};

#[test]
fn simple_select_binds_and_materializes() {
    let mapper = r#"<mapper namespace="U">
  <select id="findById" resultType="User">SELECT id, name FROM users WHERE id = #{id}</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-simple", mapper);
    script
        .when("SELECT id, name FROM users WHERE id = ?")
        .returns(
            &[("id", DriverType::Integer), ("name", DriverType::Varchar)],
            vec![vec![json!(7), json!("Ann")]],
        );

    let mut session = factory.open_session().unwrap();
    let row = session
        .select_one("U.findById", json!({"id": 7}))
        .unwrap()
        .unwrap();
    assert_eq!(row, json!({"id": 7, "name": "Ann"}));

    let executions = script.executions();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].sql, "SELECT id, name FROM users WHERE id = ?");
    assert_eq!(executions[0].parameters, vec![json!(7)]);
}

#[test]
fn dynamic_where_prunes_absent_conditions() {
    let mapper = r#"<mapper namespace="O">
  <select id="find" resultType="map">SELECT * FROM orders <where><if test="uid != null">AND user_id=#{uid}</if><if test="min != null">AND amount &gt;= #{min}</if></where></select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-where", mapper);
    script
        .when("SELECT * FROM orders WHERE user_id=?")
        .returns(&[("id", DriverType::Integer)], vec![vec![json!(1)]]);
    script
        .when("SELECT * FROM orders")
        .returns(&[("id", DriverType::Integer)], vec![vec![json!(1)], vec![json!(2)]]);

    let mut session = factory.open_session().unwrap();
    let rows = session
        .select_list("O.find", json!({"uid": 3, "min": null}))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        script.executions()[0].sql,
        "SELECT * FROM orders WHERE user_id=?"
    );
    assert_eq!(script.executions()[0].parameters, vec![json!(3)]);

    let rows = session
        .select_list("O.find", json!({"uid": null, "min": null}))
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(script.executions()[1].sql, "SELECT * FROM orders");
    assert!(script.executions()[1].parameters.is_empty());
}

#[test]
fn foreach_expands_positional_parameters() {
    let mapper = r#"<mapper namespace="T">
  <select id="byKeys" resultType="map">SELECT * FROM t WHERE k IN <foreach item="k" collection="list" open="(" close=")" separator=",">#{k}</foreach></select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-foreach", mapper);
    script
        .when("SELECT * FROM t WHERE k IN (?,?,?)")
        .returns(&[("k", DriverType::Integer)], vec![vec![json!(1)]]);

    let mut session = factory.open_session().unwrap();
    session
        .select_list("T.byKeys", json!({"list": [1, 2, 3]}))
        .unwrap();
    assert_eq!(
        script.executions()[0].parameters,
        vec![json!(1), json!(2), json!(3)]
    );
}

#[test]
fn choose_and_bind_shape_the_sql() {
    let mapper = r#"<mapper namespace="L">
  <select id="search" resultType="map"><bind name="pattern" value="'%' + name + '%'"/>SELECT * FROM logs <where><choose><when test="kind == 'user'">actor = #{name}</when><otherwise>message LIKE #{pattern}</otherwise></choose></where></select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-choose", mapper);
    script
        .when("SELECT * FROM logs WHERE actor = ?")
        .returns(&[("id", DriverType::Integer)], vec![]);
    script
        .when("SELECT * FROM logs WHERE message LIKE ?")
        .returns(&[("id", DriverType::Integer)], vec![]);

    let mut session = factory.open_session().unwrap();
    session
        .select_list("L.search", json!({"kind": "user", "name": "ann"}))
        .unwrap();
    assert_eq!(script.executions()[0].parameters, vec![json!("ann")]);

    session
        .select_list("L.search", json!({"kind": "other", "name": "ann"}))
        .unwrap();
    assert_eq!(script.executions()[1].parameters, vec![json!("%ann%")]);
}

#[test]
fn dollar_substitution_is_verbatim() {
    let mapper = r#"<mapper namespace="S">
  <select id="sorted" resultType="map">SELECT * FROM logs ORDER BY ${col}</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-dollar", mapper);
    script
        .when("SELECT * FROM logs ORDER BY ts")
        .returns(&[("ts", DriverType::Timestamp)], vec![]);

    let mut session = factory.open_session().unwrap();
    session.select_list("S.sorted", json!({"col": "ts"})).unwrap();
    assert_eq!(script.executions()[0].sql, "SELECT * FROM logs ORDER BY ts");
}

#[test]
fn empty_result_set_yields_none() {
    let mapper = r#"<mapper namespace="U">
  <select id="findById" resultType="map">SELECT id FROM users WHERE id = #{id}</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-empty", mapper);
    script
        .when("SELECT id FROM users WHERE id = ?")
        .returns(&[("id", DriverType::Integer)], vec![]);

    let mut session = factory.open_session().unwrap();
    assert!(session
        .select_one("U.findById", json!({"id": 404}))
        .unwrap()
        .is_none());
    assert!(session
        .select_list("U.findById", json!({"id": 404}))
        .unwrap()
        .is_empty());
}

#[test]
fn select_map_keys_rows_by_property() {
    let mapper = r#"<mapper namespace="U">
  <select id="all" resultType="map">SELECT id, name FROM users</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-selectmap", mapper);
    script.when("SELECT id, name FROM users").returns(
        &[("id", DriverType::Integer), ("name", DriverType::Varchar)],
        vec![
            vec![json!(7), json!("Ann")],
            vec![json!(8), json!("Bob")],
        ],
    );

    let mut session = factory.open_session().unwrap();
    let by_id = session.select_map("U.all", Value::Null, "id").unwrap();
    assert_eq!(by_id.len(), 2);
    assert_eq!(by_id["7"]["name"], json!("Ann"));
    assert_eq!(by_id["8"]["name"], json!("Bob"));
}

#[test]
fn row_bounds_skip_and_limit() {
    let mapper = r#"<mapper namespace="U">
  <select id="all" resultType="map">SELECT id FROM users</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-bounds", mapper);
    script.when("SELECT id FROM users").returns(
        &[("id", DriverType::Integer)],
        (1..=5).map(|n| vec![json!(n)]).collect(),
    );

    let mut session = factory.open_session().unwrap();
    let rows = session
        .select_list_bounds("U.all", Value::Null, RowBounds::new(1, 2))
        .unwrap();
    assert_eq!(rows, vec![json!({"id": 2}), json!({"id": 3})]);
}

#[test]
fn cursor_streams_rows_lazily() {
    let mapper = r#"<mapper namespace="U">
  <select id="all" resultType="map">SELECT id FROM users</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-cursor", mapper);
    script.when("SELECT id FROM users").returns(
        &[("id", DriverType::Integer)],
        (1..=3).map(|n| vec![json!(n)]).collect(),
    );

    let mut session = factory.open_session().unwrap();
    let cursor = session
        .select_cursor("U.all", Value::Null, RowBounds::new(0, 2))
        .unwrap();
    let rows: Vec<Value> = cursor.map(|r| r.unwrap()).collect();
    assert_eq!(rows, vec![json!({"id": 1}), json!({"id": 2})]);
}

struct StopAfterFirst {
    seen: Vec<Value>,
}

impl ResultHandler for StopAfterFirst {
    fn handle_result(&mut self, context: &mut ResultContext) {
        self.seen.push(context.object().clone());
        context.stop();
    }
}

#[test]
fn result_handler_can_stop_the_walk() {
    let mapper = r#"<mapper namespace="U">
  <select id="all" resultType="map">SELECT id FROM users</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-handler", mapper);
    script.when("SELECT id FROM users").returns(
        &[("id", DriverType::Integer)],
        (1..=5).map(|n| vec![json!(n)]).collect(),
    );

    let mut session = factory.open_session().unwrap();
    let mut handler = StopAfterFirst { seen: Vec::new() };
    session
        .select("U.all", Value::Null, RowBounds::default(), &mut handler)
        .unwrap();
    assert_eq!(handler.seen, vec![json!({"id": 1})]);
}

#[test]
fn statement_kind_inlines_parameters() {
    let mapper = r#"<mapper namespace="U">
  <select id="raw" statementType="STATEMENT" resultType="map">SELECT id FROM users WHERE id = #{id}</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-inline", mapper);
    script
        .when("SELECT id FROM users WHERE id = 9")
        .returns(&[("id", DriverType::Integer)], vec![vec![json!(9)]]);

    let mut session = factory.open_session().unwrap();
    let row = session.select_one("U.raw", json!({"id": 9})).unwrap().unwrap();
    assert_eq!(row, json!({"id": 9}));
    assert!(script.executions()[0].parameters.is_empty());
}

#[test]
fn unknown_statement_id_fails_without_closing_the_session() {
    let mapper = r#"<mapper namespace="U">
  <select id="all" resultType="map">SELECT id FROM users</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-missing", mapper);
    script
        .when("SELECT id FROM users")
        .returns(&[("id", DriverType::Integer)], vec![vec![json!(1)]]);

    let mut session = factory.open_session().unwrap();
    let err = session.select_one("U.nope", Value::Null).unwrap_err();
    assert!(matches!(err, relmap_core::Error::StatementNotFound(_)));
    // the session stays usable
    assert_eq!(session.select_list("U.all", Value::Null).unwrap().len(), 1);
}
