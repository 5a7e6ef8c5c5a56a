mod common;

use driver::DriverType;
use relmap_core::{Error, XmlConfigBuilder};
use serde_json::{json, Value};

#[test]
fn explicit_result_map_renames_columns() {
    let mapper = r#"<mapper namespace="U">
  <resultMap id="userMap" type="map">
    <id property="userId" column="id"/>
    <result property="userName" column="name"/>
  </resultMap>
  <select id="all" resultMap="userMap">SELECT id, name FROM users</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-resultmap", mapper);
    script.when("SELECT id, name FROM users").returns(
        &[("id", DriverType::Integer), ("name", DriverType::Varchar)],
        vec![vec![json!(7), json!("Ann")]],
    );

    let mut session = factory.open_session().unwrap();
    let rows = session.select_list("U.all", Value::Null).unwrap();
    assert_eq!(rows, vec![json!({"userId": 7, "userName": "Ann"})]);
}

#[test]
fn underscore_columns_camel_case_when_enabled() {
    let mapper = r#"<mapper namespace="U">
  <select id="all" resultType="map">SELECT user_id, user_name FROM users</select>
</mapper>"#;
    let settings =
        r#"<settings><setting name="mapUnderscoreToCamelCase" value="true"/></settings>"#;
    let (script, factory) = common::factory_with("mem://it-camel", mapper, settings);
    script.when("SELECT user_id, user_name FROM users").returns(
        &[
            ("user_id", DriverType::Integer),
            ("user_name", DriverType::Varchar),
        ],
        vec![vec![json!(7), json!("Ann")]],
    );

    let mut session = factory.open_session().unwrap();
    let rows = session.select_list("U.all", Value::Null).unwrap();
    assert_eq!(rows, vec![json!({"userId": 7, "userName": "Ann"})]);
}

#[test]
fn discriminator_switches_result_maps_per_row() {
    let mapper = r#"<mapper namespace="V">
  <resultMap id="vehicleMap" type="map">
    <id property="id" column="id"/>
    <discriminator column="vtype" javaType="string">
      <case value="car" resultMap="carMap"/>
      <case value="truck" resultMap="truckMap"/>
    </discriminator>
  </resultMap>
  <resultMap id="carMap" type="map">
    <id property="id" column="id"/>
    <result property="doors" column="doors"/>
  </resultMap>
  <resultMap id="truckMap" type="map">
    <id property="id" column="id"/>
    <result property="payload" column="payload"/>
  </resultMap>
  <select id="all" resultMap="vehicleMap">SELECT * FROM vehicles</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-discriminator", mapper);
    script.when("SELECT * FROM vehicles").returns(
        &[
            ("id", DriverType::Integer),
            ("vtype", DriverType::Varchar),
            ("doors", DriverType::Integer),
            ("payload", DriverType::Integer),
        ],
        vec![
            vec![json!(1), json!("car"), json!(4), Value::Null],
            vec![json!(2), json!("truck"), Value::Null, json!(9000)],
        ],
    );

    let mut session = factory.open_session().unwrap();
    let rows = session.select_list("V.all", Value::Null).unwrap();
    assert_eq!(rows[0]["doors"], json!(4));
    assert!(rows[0].get("payload").is_none());
    assert_eq!(rows[1]["payload"], json!(9000));
}

#[test]
fn nested_result_map_aggregates_by_row_key() {
    let mapper = r#"<mapper namespace="U">
  <resultMap id="orderMap" type="map">
    <id property="oid" column="oid"/>
    <result property="amount" column="amount"/>
  </resultMap>
  <resultMap id="userMap" type="map">
    <id property="id" column="id"/>
    <result property="name" column="name"/>
    <collection property="orders" resultMap="orderMap"/>
  </resultMap>
  <select id="withOrders" resultMap="userMap">SELECT * FROM users_orders</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-nestedmap", mapper);
    script.when("SELECT * FROM users_orders").returns(
        &[
            ("id", DriverType::Integer),
            ("name", DriverType::Varchar),
            ("oid", DriverType::Integer),
            ("amount", DriverType::Double),
        ],
        vec![
            vec![json!(1), json!("Ann"), json!(10), json!(5.0)],
            vec![json!(1), json!("Ann"), json!(11), json!(7.5)],
            vec![json!(2), json!("Bob"), Value::Null, Value::Null],
        ],
    );

    let mut session = factory.open_session().unwrap();
    let rows = session.select_list("U.withOrders", Value::Null).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[0],
        json!({
            "id": 1,
            "name": "Ann",
            "orders": [
                {"oid": 10, "amount": 5.0},
                {"oid": 11, "amount": 7.5},
            ],
        })
    );
    assert_eq!(rows[1], json!({"id": 2, "name": "Bob", "orders": []}));
}

#[test]
fn inline_collection_with_column_prefix() {
    let mapper = r#"<mapper namespace="U">
  <resultMap id="userMap" type="map">
    <id property="id" column="id"/>
    <collection property="orders" columnPrefix="o_">
      <id property="oid" column="oid"/>
      <result property="amount" column="amount"/>
    </collection>
  </resultMap>
  <select id="withOrders" resultMap="userMap">SELECT * FROM users_orders</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-prefix", mapper);
    script.when("SELECT * FROM users_orders").returns(
        &[
            ("id", DriverType::Integer),
            ("o_oid", DriverType::Integer),
            ("o_amount", DriverType::Double),
        ],
        vec![
            vec![json!(1), json!(10), json!(5.0)],
            vec![json!(1), json!(11), json!(7.5)],
        ],
    );

    let mut session = factory.open_session().unwrap();
    let rows = session.select_list("U.withOrders", Value::Null).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0]["orders"],
        json!([{"oid": 10, "amount": 5.0}, {"oid": 11, "amount": 7.5}])
    );
}

#[test]
fn nested_select_fetches_related_rows() {
    let mapper = r#"<mapper namespace="U">
  <resultMap id="userMap" type="map">
    <id property="id" column="id"/>
    <result property="name" column="name"/>
    <collection property="orders" column="id" select="ordersFor"/>
  </resultMap>
  <select id="all" resultMap="userMap">SELECT id, name FROM users</select>
  <select id="ordersFor" resultType="map">SELECT oid FROM orders WHERE uid = #{uid}</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-nestedselect", mapper);
    script.when("SELECT id, name FROM users").returns(
        &[("id", DriverType::Integer), ("name", DriverType::Varchar)],
        vec![vec![json!(1), json!("Ann")]],
    );
    script
        .when("SELECT oid FROM orders WHERE uid = ?")
        .returns(
            &[("oid", DriverType::Integer)],
            vec![vec![json!(10)], vec![json!(11)]],
        );

    let mut session = factory.open_session().unwrap();
    let rows = session.select_list("U.all", Value::Null).unwrap();
    assert_eq!(
        rows[0]["orders"],
        json!([{"oid": 10}, {"oid": 11}])
    );
    // the nested statement saw the outer row's column value
    assert_eq!(
        script.executions()[1].parameters,
        vec![json!(1)]
    );
}

#[test]
fn result_map_extends_inherits_parent_mappings() {
    let mapper = r#"<mapper namespace="U">
  <resultMap id="full" type="map" extends="base">
    <result property="email" column="email"/>
  </resultMap>
  <resultMap id="base" type="map">
    <id property="id" column="id"/>
    <result property="name" column="name"/>
  </resultMap>
  <select id="all" resultMap="full">SELECT id, name, email FROM users</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-extends", mapper);
    script.when("SELECT id, name, email FROM users").returns(
        &[
            ("id", DriverType::Integer),
            ("name", DriverType::Varchar),
            ("email", DriverType::Varchar),
        ],
        vec![vec![json!(1), json!("Ann"), json!("a@x")]],
    );

    let mut session = factory.open_session().unwrap();
    let rows = session.select_list("U.all", Value::Null).unwrap();
    assert_eq!(rows, vec![json!({"id": 1, "name": "Ann", "email": "a@x"})]);
}

#[test]
fn include_fragments_expand_with_properties() {
    let mapper = r#"<mapper namespace="U">
  <sql id="cols">id, ${extra}</sql>
  <select id="all" resultType="map">SELECT <include refid="cols"><property name="extra" value="name"/></include> FROM users</select>
</mapper>"#;
    let (script, factory) = common::factory("mem://it-include", mapper);
    script.when("SELECT id, name FROM users").returns(
        &[("id", DriverType::Integer), ("name", DriverType::Varchar)],
        vec![vec![json!(1), json!("Ann")]],
    );

    let mut session = factory.open_session().unwrap();
    let rows = session.select_list("U.all", Value::Null).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(script.executions()[0].sql, "SELECT id, name FROM users");
}

#[test]
fn database_id_selects_matching_statements() {
    let script = driver::testing::install("mem://it-dbid");
    script
        .when("SELECT id FROM users /* mem */")
        .returns(&[("id", DriverType::Integer)], vec![vec![json!(1)]]);
    let config_xml = r#"<configuration>
  <environments default="test">
    <environment id="test">
      <transactionManager type="MANAGED"/>
      <dataSource type="UNPOOLED">
        <property name="url" value="mem://it-dbid"/>
        <property name="username" value="app"/>
        <property name="password" value="secret"/>
      </dataSource>
    </environment>
  </environments>
  <databaseIdProvider type="DB_VENDOR">
    <property name="mem" value="mem"/>
  </databaseIdProvider>
  <mappers><mapper resource="mapper.xml"/></mappers>
</configuration>"#;
    let mapper = r#"<mapper namespace="U">
  <select id="all" databaseId="mem" resultType="map">SELECT id FROM users /* mem */</select>
  <select id="all" databaseId="other" resultType="map">SELECT id FROM users /* other */</select>
</mapper>"#;
    let config = XmlConfigBuilder::new()
        .mapper_source("mapper.xml", mapper)
        .parse(config_xml)
        .unwrap();
    assert_eq!(config.database_id.as_deref(), Some("mem"));

    let factory = relmap_core::SqlSessionFactory::new(config);
    let mut session = factory.open_session().unwrap();
    let rows = session.select_list("U.all", Value::Null).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(script.executions()[0].sql, "SELECT id FROM users /* mem */");
}

const LINKED_SETS_MAPPER: &str = r#"<mapper namespace="U">
  <resultMap id="orderMap" type="map">
    <id property="oid" column="oid"/>
  </resultMap>
  <resultMap id="userMap" type="map">
    <id property="id" column="id"/>
    <result property="name" column="name"/>
    <collection property="orders" column="id" foreignColumn="uid" resultSet="orders" resultMap="orderMap"/>
  </resultMap>
  <select id="usersAndOrders" resultMap="userMap" resultSets="users,orders">CALL fetch_users_orders()</select>
</mapper>"#;

#[test]
fn linked_result_sets_fill_parents_by_foreign_column() {
    let (script, factory) = common::factory("mem://it-linkedsets", LINKED_SETS_MAPPER);
    script
        .when("CALL fetch_users_orders()")
        .returns(
            &[("id", DriverType::Integer), ("name", DriverType::Varchar)],
            vec![
                vec![json!(1), json!("Ann")],
                vec![json!(2), json!("Bob")],
            ],
        )
        .returns(
            &[("oid", DriverType::Integer), ("uid", DriverType::Integer)],
            vec![
                vec![json!(10), json!(1)],
                vec![json!(11), json!(1)],
                vec![json!(12), json!(2)],
            ],
        );

    let mut session = factory.open_session().unwrap();
    let rows = session.select_list("U.usersAndOrders", Value::Null).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["orders"], json!([{"oid": 10}, {"oid": 11}]));
    assert_eq!(rows[1]["orders"], json!([{"oid": 12}]));
}

#[test]
fn missing_trailing_result_sets_stop_quietly() {
    let (script, factory) = common::factory("mem://it-fewersets", LINKED_SETS_MAPPER);
    // the driver produces only the first of the two declared result sets
    script.when("CALL fetch_users_orders()").returns(
        &[("id", DriverType::Integer), ("name", DriverType::Varchar)],
        vec![vec![json!(1), json!("Ann")]],
    );

    let mut session = factory.open_session().unwrap();
    let rows = session.select_list("U.usersAndOrders", Value::Null).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["orders"], json!([]));
}

#[test]
fn unresolved_references_fail_the_build() {
    let mapper = r#"<mapper namespace="U">
  <resultMap id="full" type="map" extends="missingParent">
    <result property="email" column="email"/>
  </resultMap>
</mapper>"#;
    let config_xml = r#"<configuration>
  <mappers><mapper resource="mapper.xml"/></mappers>
</configuration>"#;
    let err = XmlConfigBuilder::new()
        .mapper_source("mapper.xml", mapper)
        .parse(config_xml)
        .unwrap_err();
    assert!(matches!(err, Error::ConfigIncomplete(_)));
}

#[test]
fn unknown_settings_fail_the_build() {
    let config_xml = r#"<configuration>
  <settings><setting name="cacheEnalbed" value="true"/></settings>
</configuration>"#;
    let err = XmlConfigBuilder::new().parse(config_xml).unwrap_err();
    assert!(matches!(err, Error::UnknownSetting(name) if name == "cacheEnalbed"));
}

#[test]
fn malformed_markup_fails_the_build() {
    let err = XmlConfigBuilder::new().parse("<configuration><oops>").unwrap_err();
    assert!(matches!(err, Error::ConfigMalformed { .. }));
}

#[test]
fn cache_ref_shares_a_namespace_cache() {
    let script = driver::testing::install("mem://it-cacheref");
    script
        .when("SELECT id FROM a")
        .returns(&[("id", DriverType::Integer)], vec![vec![json!(1)]]);
    let config_xml = r#"<configuration>
  <environments default="test">
    <environment id="test">
      <transactionManager type="MANAGED"/>
      <dataSource type="UNPOOLED">
        <property name="url" value="mem://it-cacheref"/>
        <property name="username" value="app"/>
        <property name="password" value="secret"/>
      </dataSource>
    </environment>
  </environments>
  <mappers>
    <mapper resource="b.xml"/>
    <mapper resource="a.xml"/>
  </mappers>
</configuration>"#;
    // b refers to a's cache before a is parsed: resolved by the pending queue
    let b = r#"<mapper namespace="B">
  <cache-ref namespace="A"/>
  <select id="one" resultType="map">SELECT id FROM a</select>
</mapper>"#;
    let a = r#"<mapper namespace="A">
  <cache/>
</mapper>"#;
    let config = XmlConfigBuilder::new()
        .mapper_source("b.xml", b)
        .mapper_source("a.xml", a)
        .parse(config_xml)
        .unwrap();
    assert_eq!(config.effective_cache("B").unwrap().id(), "A");

    // and the shared cache actually serves across sessions
    let factory = relmap_core::SqlSessionFactory::new(config);
    let mut s1 = factory.open_session().unwrap();
    s1.select_list("B.one", Value::Null).unwrap();
    s1.commit(false).unwrap();
    let mut s2 = factory.open_session().unwrap();
    s2.select_list("B.one", Value::Null).unwrap();
    assert_eq!(script.execution_count("SELECT id FROM a"), 1);
}
