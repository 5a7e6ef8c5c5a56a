use driver::testing::{self, Script};
use relmap_core::{SqlSessionFactory, XmlConfigBuilder};

/// Build a session factory over a scripted in-memory scenario. The config
/// markup carries the given extra settings and one mapper source.
pub fn factory_with(url: &str, mapper_xml: &str, settings_xml: &str) -> (Script, SqlSessionFactory) {
    // tests should not spend time writing log files
    logger::Logger::set_log_level("off".to_string());
    let script = testing::install(url);
    let config_xml = format!(
        r#"<configuration>
  {settings_xml}
  <environments default="test">
    <environment id="test">
      <transactionManager type="MANAGED"/>
      <dataSource type="POOLED">
        <property name="url" value="{url}"/>
        <property name="username" value="app"/>
        <property name="password" value="secret"/>
      </dataSource>
    </environment>
  </environments>
  <mappers>
    <mapper resource="mapper.xml"/>
  </mappers>
</configuration>"#
    );
    let config = XmlConfigBuilder::new()
        .mapper_source("mapper.xml", mapper_xml)
        .parse(&config_xml)
        .unwrap_or_else(|e| panic!("configuration build failed: {e}"));
    (script, SqlSessionFactory::new(config))
}

pub fn factory(url: &str, mapper_xml: &str) -> (Script, SqlSessionFactory) {
    factory_with(url, mapper_xml, "")
}
